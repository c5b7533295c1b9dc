//! The wiremock-backed HTTP server: discovery endpoints plus a mutable
//! resource store answering GET/POST/PUT/DELETE.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value as Json};
use tracing::{debug, trace};
use wiremock::matchers::{header_regex, method, path, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use super::discovery::MockDiscovery;

/// Shared mutable resource state: (collection path, name) → object.
pub type SharedResources = Arc<RwLock<HashMap<(String, String), Json>>>;

/// A mock Kubernetes API server definition.
#[derive(Default)]
pub struct MockK8sServer {
	discovery: Option<MockDiscovery>,
	/// Objects to serve initially. Collection paths are derived from
	/// apiVersion/kind using the discovery data.
	resources: Vec<Json>,
}

/// A running server instance.
pub struct RunningMockK8sServer {
	server: MockServer,
	resources: SharedResources,
}

impl MockK8sServer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_resources(mut self, resources: Vec<Json>) -> Self {
		self.resources = resources;
		self
	}

	/// Override the served discovery data.
	pub fn with_discovery(mut self, discovery: MockDiscovery) -> Self {
		self.discovery = Some(discovery);
		self
	}

	/// Start the server with all configured resources registered.
	pub async fn start(self) -> RunningMockK8sServer {
		let server = MockServer::start().await;
		let discovery = self.discovery.unwrap_or_default();

		debug!(uri = %server.uri(), "started mock k8s server");

		let mut resources: HashMap<(String, String), Json> = HashMap::new();
		for manifest in self.resources {
			if let Some((collection, name)) = collection_path_for(&manifest, &discovery) {
				trace!(collection = %collection, name = %name, "registered resource");
				resources.insert((collection, name), manifest);
			}
		}

		let shared = Arc::new(RwLock::new(resources));
		mount_version(&server).await;
		mount_discovery(&server, &discovery).await;
		mount_resources(&server, &shared).await;

		RunningMockK8sServer {
			server,
			resources: shared,
		}
	}
}

impl RunningMockK8sServer {
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Requests the server has received, for assertions on methods, paths
	/// and bodies.
	pub async fn received_requests(&self) -> Vec<Request> {
		self.server.received_requests().await.unwrap_or_default()
	}

	/// Current object stored at (collection, name), if any.
	pub fn stored(&self, collection: &str, name: &str) -> Option<Json> {
		self.resources
			.read()
			.expect("mock store lock poisoned")
			.get(&(collection.to_string(), name.to_string()))
			.cloned()
	}

	/// A kube client configured against this server.
	pub fn client(&self) -> kube::Client {
		let config = kube::Config::new(
			self.uri().parse().expect("mock server uri is a valid url"),
		);
		kube::Client::try_from(config).expect("building client for mock server")
	}

	/// A kubeconfig pointing at this server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";
		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: "mock-context".to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: user_name.to_string(),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some("mock-context".to_string()),
			..Default::default()
		}
	}
}

/// Derive the collection path for a manifest using discovery data.
fn collection_path_for(manifest: &Json, discovery: &MockDiscovery) -> Option<(String, String)> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let name = manifest.pointer("/metadata/name")?.as_str()?.to_string();
	let namespace = manifest.pointer("/metadata/namespace").and_then(Json::as_str);

	let (plural, namespaced) = if api_version.contains('/') {
		let rs = discovery
			.group_resources
			.iter()
			.find(|(gv, _)| *gv == api_version)?
			.1
			.iter()
			.find(|r| r.kind == kind)?;
		(rs.name, rs.namespaced)
	} else {
		let rs = discovery.core_resources.iter().find(|r| r.kind == kind)?;
		(rs.name, rs.namespaced)
	};

	let prefix = if api_version.contains('/') {
		format!("/apis/{}", api_version)
	} else {
		format!("/api/{}", api_version)
	};
	let path = if namespaced {
		format!(
			"{}/namespaces/{}/{}",
			prefix,
			namespace.unwrap_or("default"),
			plural
		)
	} else {
		format!("{}/{}", prefix, plural)
	};

	Some((path, name))
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "30",
			"gitVersion": "v1.30.0",
			"gitCommit": "mock",
			"gitTreeState": "clean",
			"buildDate": "2025-01-01T00:00:00Z",
			"goVersion": "go1.22.0",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

async fn mount_discovery(server: &MockServer, discovery: &MockDiscovery) {
	// Aggregated discovery is rejected so clients use the legacy endpoints.
	for p in ["/api", "/apis"] {
		Mock::given(method("GET"))
			.and(path(p))
			.and(header_regex("accept", "apidiscovery"))
			.respond_with(ResponseTemplate::new(406))
			.mount(server)
			.await;
	}

	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let groups: Vec<Json> = discovery
		.group_resources
		.iter()
		.map(|(gv, _)| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			json!({
				"name": group,
				"versions": [{"groupVersion": gv, "version": version}],
				"preferredVersion": {"groupVersion": gv, "version": version}
			})
		})
		.collect();

	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": groups
		})))
		.mount(server)
		.await;

	let core: Vec<Json> = discovery
		.core_resources
		.iter()
		.map(|r| {
			json!({
				"name": r.name,
				"singularName": "",
				"namespaced": r.namespaced,
				"kind": r.kind,
				"verbs": r.verbs,
			})
		})
		.collect();

	Mock::given(method("GET"))
		.and(path("/api/v1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIResourceList",
			"apiVersion": "v1",
			"groupVersion": "v1",
			"resources": core
		})))
		.mount(server)
		.await;

	for (gv, rs) in &discovery.group_resources {
		let resources: Vec<Json> = rs
			.iter()
			.map(|r| {
				json!({
					"name": r.name,
					"singularName": "",
					"namespaced": r.namespaced,
					"kind": r.kind,
					"verbs": r.verbs,
				})
			})
			.collect();

		Mock::given(method("GET"))
			.and(path(format!("/apis/{}", gv)))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"kind": "APIResourceList",
				"apiVersion": "v1",
				"groupVersion": gv,
				"resources": resources
			})))
			.mount(server)
			.await;
	}
}

fn not_found_status() -> Json {
	json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": "not found",
		"reason": "NotFound",
		"code": 404
	})
}

async fn mount_resources(server: &MockServer, resources: &SharedResources) {
	static RESOURCE_VERSION: AtomicU64 = AtomicU64::new(1);
	let get_resources = Arc::clone(resources);
	let put_resources = Arc::clone(resources);
	let post_resources = Arc::clone(resources);
	let delete_resources = Arc::clone(resources);

	// PUT replaces an object at its name URL, bumping resourceVersion.
	Mock::given(method("PUT"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let (collection, name) = split_name(req.url.path());
			let mut body: Json = match serde_json::from_slice(&req.body) {
				Ok(b) => b,
				Err(_) => return ResponseTemplate::new(400),
			};
			let rv = RESOURCE_VERSION.fetch_add(1, Ordering::SeqCst) + 1;
			set_resource_version(&mut body, rv);
			put_resources
				.write()
				.expect("mock store lock poisoned")
				.insert((collection, name), body.clone());
			ResponseTemplate::new(200).set_body_json(body)
		})
		.mount(server)
		.await;

	// POST creates an object at its collection URL.
	Mock::given(method("POST"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let collection = req.url.path().trim_end_matches('/').to_string();
			let mut body: Json = match serde_json::from_slice(&req.body) {
				Ok(b) => b,
				Err(_) => return ResponseTemplate::new(400),
			};
			let name = body
				.pointer("/metadata/name")
				.and_then(Json::as_str)
				.unwrap_or_default()
				.to_string();
			if name.is_empty() {
				return ResponseTemplate::new(422);
			}

			let mut store = post_resources.write().expect("mock store lock poisoned");
			if store.contains_key(&(collection.clone(), name.clone())) {
				return ResponseTemplate::new(409).set_body_json(json!({
					"kind": "Status",
					"apiVersion": "v1",
					"status": "Failure",
					"reason": "AlreadyExists",
					"message": format!("{} already exists", name),
					"code": 409
				}));
			}
			let rv = RESOURCE_VERSION.fetch_add(1, Ordering::SeqCst) + 1;
			set_resource_version(&mut body, rv);
			store.insert((collection, name), body.clone());
			ResponseTemplate::new(201).set_body_json(body)
		})
		.mount(server)
		.await;

	// DELETE removes an object and reports the propagation policy back in
	// the status details for assertions.
	Mock::given(method("DELETE"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let (collection, name) = split_name(req.url.path());
			let existed = delete_resources
				.write()
				.expect("mock store lock poisoned")
				.remove(&(collection, name.clone()))
				.is_some();
			if !existed {
				return ResponseTemplate::new(404).set_body_json(not_found_status());
			}
			ResponseTemplate::new(200).set_body_json(json!({
				"kind": "Status",
				"apiVersion": "v1",
				"status": "Success",
				"details": {"name": name}
			}))
		})
		.mount(server)
		.await;

	// GET serves single objects, lists, or a NotFound status.
	Mock::given(method("GET"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let path_str = req.url.path().trim_end_matches('/');
			let store = get_resources.read().expect("mock store lock poisoned");

			let (collection, name) = split_name(path_str);
			if !name.is_empty() {
				if let Some(obj) = store.get(&(collection, name)) {
					return ResponseTemplate::new(200).set_body_json(obj.clone());
				}
			}

			let items: Vec<Json> = store
				.iter()
				.filter(|((c, _), _)| c == path_str)
				.map(|(_, v)| v.clone())
				.collect();
			if !items.is_empty() {
				return ResponseTemplate::new(200).set_body_json(json!({
					"kind": "List",
					"apiVersion": "v1",
					"metadata": {"resourceVersion": "1"},
					"items": items
				}));
			}

			ResponseTemplate::new(404).set_body_json(not_found_status())
		})
		.mount(server)
		.await;
}

/// Split a name-targeted path into (collection, name).
fn split_name(path: &str) -> (String, String) {
	let path = path.trim_end_matches('/');
	match path.rfind('/') {
		Some(i) => (path[..i].to_string(), path[i + 1..].to_string()),
		None => (path.to_string(), String::new()),
	}
}

fn set_resource_version(body: &mut Json, rv: u64) {
	if let Some(meta) = body.pointer_mut("/metadata") {
		if let Some(obj) = meta.as_object_mut() {
			obj.insert("resourceVersion".to_string(), Json::String(rv.to_string()));
		}
	}
}
