//! Apply engine behavior against the mock API server: create-vs-update
//! dispatch, metadata policy, immutability handling, deletes, waits and
//! dry-run.

use std::time::{Duration, Instant};

use amphipod::k8s::engine::{ApplyEngine, EngineError, EngineOptions};
use amphipod::k8s::scheme::ObjectDocument;
use amphipod::{CONTEXT_ANNOTATION, HERITAGE_LABEL, HERITAGE_VALUE};
use assert_matches::assert_matches;
use kube_mock::MockK8sServer;
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;

fn pod(spec: Json) -> ObjectDocument {
	ObjectDocument::from_json(json!({
		"apiVersion": "v1",
		"kind": "Pod",
		"spec": spec,
	}))
	.unwrap()
}

/// Requests against object URLs, skipping discovery traffic.
async fn object_requests(server: &kube_mock::RunningMockK8sServer, fragment: &str) -> Vec<(String, String)> {
	server
		.received_requests()
		.await
		.iter()
		.filter(|r| r.url.path().contains(fragment))
		.map(|r| (r.method.to_string(), r.url.path().to_string()))
		.collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_then_update_pod() {
	let server = MockK8sServer::new().start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();
	let ctx = json!({"cluster": "test"});

	// First run: 404 probe then POST to the collection URL.
	engine
		.put(&ctx, "foo", "bar", "", "", vec![pod(json!({"restartPolicy": "Always"}))], &cancel)
		.await
		.unwrap();

	let reqs = object_requests(&server, "/pods").await;
	assert_eq!(
		reqs,
		vec![
			("GET".to_string(), "/api/v1/namespaces/bar/pods/foo".to_string()),
			("POST".to_string(), "/api/v1/namespaces/bar/pods".to_string()),
		]
	);

	let live = server.stored("/api/v1/namespaces/bar/pods", "foo").unwrap();
	let live_rv = live
		.pointer("/metadata/resourceVersion")
		.and_then(Json::as_str)
		.unwrap()
		.to_string();

	// Second run: probe finds the object, PUT to the name URL carrying the
	// live resourceVersion.
	engine
		.put(&ctx, "foo", "bar", "", "", vec![pod(json!({"restartPolicy": "Never"}))], &cancel)
		.await
		.unwrap();

	let reqs = server.received_requests().await;
	let put = reqs
		.iter()
		.find(|r| r.method.to_string() == "PUT")
		.expect("expected a PUT request");
	assert_eq!(put.url.path(), "/api/v1/namespaces/bar/pods/foo");

	let body: Json = serde_json::from_slice(&put.body).unwrap();
	assert_eq!(
		body.pointer("/metadata/resourceVersion").and_then(Json::as_str),
		Some(live_rv.as_str())
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_policy_on_writes() {
	let server = MockK8sServer::new().start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();
	let ctx = json!({"cluster": "minikube", "env": "prod"});

	let cm = ObjectDocument::from_json(json!({
		"apiVersion": "v1",
		"kind": "ConfigMap",
		"metadata": {"labels": {"app": "web"}},
		"data": {"k": "v"},
	}))
	.unwrap();
	engine.put(&ctx, "cm", "default", "", "", vec![cm], &cancel).await.unwrap();

	let stored = server.stored("/api/v1/namespaces/default/configmaps", "cm").unwrap();

	// Heritage label is present alongside the user's labels.
	assert_eq!(
		stored.pointer(&format!("/metadata/labels/{}", HERITAGE_LABEL)),
		Some(&json!(HERITAGE_VALUE))
	);
	assert_eq!(stored.pointer("/metadata/labels/app"), Some(&json!("web")));

	// The context annotation round-trips the addon context.
	let ann = stored
		.pointer(&format!(
			"/metadata/annotations/{}",
			CONTEXT_ANNOTATION.replace('/', "~1")
		))
		.and_then(Json::as_str)
		.unwrap();
	let round_trip: Json = serde_json::from_str(ann).unwrap();
	assert_eq!(round_trip, ctx);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_name_mismatch_fails() {
	let server = MockK8sServer::new().start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();

	let cm = ObjectDocument::from_json(json!({
		"apiVersion": "v1",
		"kind": "ConfigMap",
		"metadata": {"name": "other"},
	}))
	.unwrap();
	let err = engine
		.put(&json!({}), "mine", "default", "", "", vec![cm], &cancel)
		.await
		.unwrap_err();
	assert_matches!(err, EngineError::NameMismatch { .. });

	// Nothing was written.
	assert!(server.stored("/api/v1/namespaces/default/configmaps", "mine").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_immutable_role_ref_without_force() {
	let live = json!({
		"apiVersion": "rbac.authorization.k8s.io/v1",
		"kind": "ClusterRoleBinding",
		"metadata": {"name": "crb", "resourceVersion": "5"},
		"roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "admin"},
	});
	let server = MockK8sServer::new().with_resources(vec![live]).start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();

	let desired = ObjectDocument::from_json(json!({
		"apiVersion": "rbac.authorization.k8s.io/v1",
		"kind": "ClusterRoleBinding",
		"roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "edit"},
	}))
	.unwrap();

	let err = engine
		.put(&json!({}), "crb", "", "", "", vec![desired], &cancel)
		.await
		.unwrap_err();
	assert_matches!(err, EngineError::Immutable { attribute, .. } if attribute == "roleRef");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_immutable_with_force_deletes_and_recreates() {
	let live = json!({
		"apiVersion": "rbac.authorization.k8s.io/v1",
		"kind": "ClusterRoleBinding",
		"metadata": {"name": "crb", "resourceVersion": "5"},
		"roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "admin"},
	});
	let server = MockK8sServer::new().with_resources(vec![live]).start().await;
	let engine = ApplyEngine::new(
		server.client(),
		EngineOptions {
			force: true,
			..Default::default()
		},
	);
	let cancel = CancellationToken::new();

	let desired = ObjectDocument::from_json(json!({
		"apiVersion": "rbac.authorization.k8s.io/v1",
		"kind": "ClusterRoleBinding",
		"roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "edit"},
	}))
	.unwrap();
	engine.put(&json!({}), "crb", "", "", "", vec![desired], &cancel).await.unwrap();

	let reqs = object_requests(&server, "clusterrolebindings").await;
	let methods: Vec<&str> = reqs.iter().map(|(m, _)| m.as_str()).collect();
	assert_eq!(methods, vec!["GET", "DELETE", "POST"]);

	// The delete that clears the immutable object uses foreground
	// propagation.
	let all = server.received_requests().await;
	let delete = all.iter().find(|r| r.method.to_string() == "DELETE").unwrap();
	let body: Json = serde_json::from_slice(&delete.body).unwrap();
	assert_eq!(body.pointer("/propagationPolicy"), Some(&json!("Foreground")));

	let stored = server
		.stored("/apis/rbac.authorization.k8s.io/v1/clusterrolebindings", "crb")
		.unwrap();
	assert_eq!(stored.pointer("/roleRef/name"), Some(&json!("edit")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_with_foreground_propagation() {
	let live = json!({
		"apiVersion": "apps/v1",
		"kind": "Deployment",
		"metadata": {"name": "test", "namespace": "default"},
	});
	let server = MockK8sServer::new().with_resources(vec![live]).start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();

	let r = engine
		.resolve_resource("test", "default", "apps", "deployment")
		.await
		.unwrap();
	engine.delete(&r, true, &cancel).await.unwrap();

	let all = server.received_requests().await;
	let delete = all.iter().find(|r| r.method.to_string() == "DELETE").unwrap();
	assert_eq!(
		delete.url.path(),
		"/apis/apps/v1/namespaces/default/deployments/test"
	);
	let body: Json = serde_json::from_slice(&delete.body).unwrap();
	assert_eq!(body.pointer("/propagationPolicy"), Some(&json!("Foreground")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subresource_requires_parent() {
	let server = MockK8sServer::new().start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();

	let err = engine
		.put(
			&json!({}),
			"missing",
			"default",
			"",
			"status",
			vec![pod(json!({}))],
			&cancel,
		)
		.await
		.unwrap_err();
	assert_matches!(err, EngineError::ParentResourceMissing);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_yaml_document_identity_wins() {
	let server = MockK8sServer::new().start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();

	let doc = ObjectDocument::decode(
		"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: fromdoc\n  namespace: docns\ndata:\n  a: b\n",
	)
	.unwrap();
	engine
		.put_yaml(&json!({}), "ignored", "alsoignored", vec![doc], &cancel)
		.await
		.unwrap();

	assert!(server.stored("/api/v1/namespaces/docns/configmaps", "fromdoc").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_with_wait_times_out() {
	let server = MockK8sServer::new().start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();

	let r = engine.resolve_resource("y", "x", "", "pod").await.unwrap();
	let start = Instant::now();
	let err = engine
		.get(&r, Some(Duration::from_secs(2)), &cancel)
		.await
		.unwrap_err();
	let elapsed = start.elapsed();

	assert_matches!(err, EngineError::NotFound);
	assert!(elapsed >= Duration::from_secs(1), "gave up too early: {elapsed:?}");
	assert!(elapsed < Duration::from_secs(4), "waited too long: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_cancellation() {
	let server = MockK8sServer::new().start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();

	let r = engine.resolve_resource("y", "x", "", "pod").await.unwrap();
	let cancel_clone = cancel.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(300)).await;
		cancel_clone.cancel();
	});

	let err = engine
		.get(&r, Some(Duration::from_secs(30)), &cancel)
		.await
		.unwrap_err();
	assert_matches!(err, EngineError::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dry_run_never_mutates() {
	let live = json!({
		"apiVersion": "v1",
		"kind": "ConfigMap",
		"metadata": {"name": "existing", "namespace": "default", "resourceVersion": "3"},
		"data": {"a": "old"},
	});
	let server = MockK8sServer::new().with_resources(vec![live]).start().await;
	let engine = ApplyEngine::new(
		server.client(),
		EngineOptions {
			dry_run: true,
			..Default::default()
		},
	);
	let cancel = CancellationToken::new();

	// Update path, create path, and delete, all under dry-run.
	let update = ObjectDocument::from_json(json!({
		"apiVersion": "v1",
		"kind": "ConfigMap",
		"data": {"a": "new"},
	}))
	.unwrap();
	engine.put(&json!({}), "existing", "default", "", "", vec![update], &cancel).await.unwrap();

	let create = ObjectDocument::from_json(json!({
		"apiVersion": "v1",
		"kind": "ConfigMap",
		"data": {"b": "x"},
	}))
	.unwrap();
	engine.put(&json!({}), "fresh", "default", "", "", vec![create], &cancel).await.unwrap();

	let r = engine
		.resolve_resource("existing", "default", "", "configmap")
		.await
		.unwrap();
	engine.delete(&r, false, &cancel).await.unwrap();

	for req in server.received_requests().await {
		assert_eq!(req.method.to_string(), "GET", "dry-run sent {} {}", req.method, req.url.path());
	}
	assert_eq!(
		server
			.stored("/api/v1/namespaces/default/configmaps", "existing")
			.unwrap()
			.pointer("/data/a"),
		Some(&json!("old"))
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exists_variants() {
	let live = json!({
		"apiVersion": "v1",
		"kind": "ConfigMap",
		"metadata": {"name": "here", "namespace": "default"},
	});
	let server = MockK8sServer::new().with_resources(vec![live]).start().await;
	let engine = ApplyEngine::new(server.client(), EngineOptions::default());
	let cancel = CancellationToken::new();

	let here = engine.resolve_resource("here", "default", "", "configmap").await.unwrap();
	assert!(engine.get(&here, None, &cancel).await.is_ok());

	let missing = engine.resolve_resource("gone", "default", "", "configmap").await.unwrap();
	assert_matches!(
		engine.get(&missing, None, &cancel).await.unwrap_err(),
		EngineError::NotFound
	);
}
