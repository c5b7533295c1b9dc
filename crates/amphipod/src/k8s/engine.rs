//! The apply engine: turns one desired object plus its nominal identity into
//! at most one HTTP request against the API server.
//!
//! Reconciliation probes the name URL first: a 404 routes to POST on the
//! collection URL, an existing object routes to PUT after the merge policy
//! and immutability check. Dry-run renders the unified diff and stops before
//! sending anything.

use std::time::Duration;

use http::Request;
use kube::{
	api::{Api, DeleteParams, DynamicObject, PropagationPolicy},
	core::GroupVersionKind,
	Client,
};
use serde_json::Value as Json;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::diff::{print_unified_diff, DiffError};
use super::resolve::{maybe_namespaced, ApiResource, ResolveError, ResourceCache};
use super::scheme::{DecodeError, ObjectDocument};
use crate::{CONTEXT_ANNOTATION, HERITAGE_LABEL, HERITAGE_VALUE};

/// Interval between consecutive get retries while waiting.
const WAIT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Errors produced by the apply engine.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error(transparent)]
	Resolve(#[from] ResolveError),

	#[error(transparent)]
	Decode(#[from] DecodeError),

	#[error(transparent)]
	Diff(#[from] DiffError),

	#[error("name=`{arg}' argument does not match object's .metadata.name=`{declared}'")]
	NameMismatch { arg: String, declared: String },

	#[error("namespace=`{arg}' argument does not match object's .metadata.namespace=`{declared}'")]
	NamespaceMismatch { arg: String, declared: String },

	#[error("parent resource does not exist")]
	ParentResourceMissing,

	#[error("failed to update {attribute} of resource {resource}: cannot update immutable. Use --force to delete and recreate")]
	Immutable { attribute: String, resource: String },

	#[error("not found")]
	NotFound,

	#[error("operation cancelled")]
	Cancelled,

	#[error("server returned {code}: {message}")]
	Server { code: u16, message: String },

	#[error("kubernetes request failed")]
	Kube(#[source] Box<kube::Error>),

	#[error("failed to encode request body")]
	Encode(#[source] serde_json::Error),
}

impl From<kube::Error> for EngineError {
	fn from(e: kube::Error) -> Self {
		match e {
			kube::Error::Api(status) => EngineError::Server {
				code: status.code,
				message: status.message,
			},
			other => EngineError::Kube(Box::new(other)),
		}
	}
}

/// Simple token bucket bounding the request rate against one API server.
struct RateLimiter {
	qps: f64,
	burst: f64,
	state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
	fn new(qps: u32, burst: u32) -> Self {
		Self {
			qps: f64::from(qps),
			burst: f64::from(burst.max(1)),
			state: Mutex::new((f64::from(burst.max(1)), Instant::now())),
		}
	}

	async fn acquire(&self) {
		if self.qps <= 0.0 {
			return;
		}
		loop {
			let wait = {
				let mut state = self.state.lock().await;
				let (ref mut tokens, ref mut last) = *state;
				let now = Instant::now();
				*tokens = (*tokens + now.duration_since(*last).as_secs_f64() * self.qps)
					.min(self.burst);
				*last = now;
				if *tokens >= 1.0 {
					*tokens -= 1.0;
					return;
				}
				Duration::from_secs_f64((1.0 - *tokens) / self.qps)
			};
			tokio::time::sleep(wait).await;
		}
	}
}

/// Engine options fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
	pub dry_run: bool,
	pub force: bool,
	pub diff: bool,
	pub diff_filters: Vec<String>,
	pub qps: u32,
	pub burst: u32,
}

/// The apply engine bound to one cluster session. All mutable configuration
/// is set at construction; safe for concurrent use.
pub struct ApplyEngine {
	client: Client,
	cache: OnceCell<ResourceCache>,
	limiter: RateLimiter,
	opts: EngineOptions,
}

impl ApplyEngine {
	pub fn new(client: Client, opts: EngineOptions) -> Self {
		Self {
			client,
			cache: OnceCell::new(),
			limiter: RateLimiter::new(opts.qps, opts.burst),
			opts,
		}
	}

	pub fn dry_run(&self) -> bool {
		self.opts.dry_run
	}

	async fn cache(&self) -> Result<&ResourceCache, EngineError> {
		Ok(self
			.cache
			.get_or_try_init(|| ResourceCache::build(&self.client))
			.await?)
	}

	/// Apply every item of `data`: metadata policy, resolution, reconcile.
	#[instrument(skip_all, fields(name = %name, namespace = %namespace, count = data.len()))]
	pub async fn put(
		&self,
		ctx: &Json,
		name: &str,
		namespace: &str,
		api_group: &str,
		subresource: &str,
		data: Vec<ObjectDocument>,
		cancel: &CancellationToken,
	) -> Result<(), EngineError> {
		let cache = self.cache().await?;
		for mut doc in data {
			set_metadata(ctx, name, namespace, &mut doc.json)?;

			let r = match ApiResource::for_object(
				cache, name, namespace, api_group, subresource, &doc.gvk,
			) {
				Ok(r) => r,
				Err(e @ ResolveError::NoKindMatch { .. }) if self.opts.dry_run => {
					// Unknown kinds are non-fatal in dry-run mode; render
					// the right side only.
					tracing::warn!(error = %e, "unknown kind, rendering head only");
					self.print_diff(None, &doc.json, &doc.gvk, name, namespace)?;
					continue;
				}
				Err(e) => return Err(e.into()),
			};

			self.reconcile(&r, doc.json, cancel).await?;
		}
		Ok(())
	}

	/// Apply YAML/JSON documents through the dynamic path. The document's
	/// declared name and namespace win over the caller's arguments (the
	/// permissive CRD path; equality is deliberately not enforced here).
	#[instrument(skip_all, fields(name = %name, namespace = %namespace, count = data.len()))]
	pub async fn put_yaml(
		&self,
		ctx: &Json,
		name: &str,
		namespace: &str,
		data: Vec<ObjectDocument>,
		cancel: &CancellationToken,
	) -> Result<(), EngineError> {
		let cache = self.cache().await?;
		for mut doc in data {
			let name = doc.name().unwrap_or(name).to_string();
			let namespace = doc.namespace().unwrap_or(namespace).to_string();

			let r = match ApiResource::for_kind(cache, &name, &namespace, "", &doc.gvk) {
				Ok(r) => r,
				Err(e @ ResolveError::NoKindMatch { .. }) if self.opts.dry_run => {
					tracing::warn!(error = %e, "unknown kind, rendering head only");
					self.print_diff(None, &doc.json, &doc.gvk, &name, &namespace)?;
					continue;
				}
				Err(e) => return Err(e.into()),
			};

			set_metadata(ctx, &r.name, &r.namespace, &mut doc.json)?;
			self.reconcile(&r, doc.json, cancel).await?;
		}
		Ok(())
	}

	/// Delete `namespace/name` with Background propagation, or Foreground
	/// when requested. Dry-run is a no-op.
	#[instrument(skip(self, cancel), fields(resource = %r))]
	pub async fn delete(
		&self,
		r: &ApiResource,
		foreground: bool,
		cancel: &CancellationToken,
	) -> Result<(), EngineError> {
		tracing::debug!(url = %r.path_with_name(), "DELETE");
		if self.opts.dry_run {
			return Ok(());
		}

		let api = self.dynamic_api(r);
		let dp = DeleteParams {
			propagation_policy: Some(if foreground {
				PropagationPolicy::Foreground
			} else {
				PropagationPolicy::Background
			}),
			..Default::default()
		};

		self.limiter.acquire().await;
		let fut = api.delete(&r.name, &dp);
		tokio::select! {
			_ = cancel.cancelled() => return Err(EngineError::Cancelled),
			res = fut => { res?; }
		}

		tracing::info!("{} deleted", r);
		Ok(())
	}

	/// Read one object, retrying every second while `wait` allows. Returns
	/// `NotFound` when the object never appears.
	#[instrument(skip(self, cancel), fields(resource = %r, wait = ?wait))]
	pub async fn get(
		&self,
		r: &ApiResource,
		wait: Option<Duration>,
		cancel: &CancellationToken,
	) -> Result<Json, EngineError> {
		let url = r.path_with_name();
		let deadline = wait.map(|d| Instant::now() + d);

		loop {
			if let Some(obj) = self.peek(&url, cancel).await? {
				return Ok(obj);
			}

			match deadline {
				None => return Err(EngineError::NotFound),
				Some(d) if Instant::now() + WAIT_RETRY_INTERVAL > d => {
					return Err(EngineError::NotFound)
				}
				Some(_) => {}
			}

			tokio::select! {
				_ = cancel.cancelled() => return Err(EngineError::Cancelled),
				_ = tokio::time::sleep(WAIT_RETRY_INTERVAL) => {}
			}
		}
	}

	/// Resolve a descriptor for the `<resource>=<value>` argument family.
	pub async fn resolve_resource(
		&self,
		name: &str,
		namespace: &str,
		api_group: &str,
		resource: &str,
	) -> Result<ApiResource, EngineError> {
		let cache = self.cache().await?;
		Ok(ApiResource::for_resource(cache, name, namespace, api_group, resource)?)
	}

	/// GET the url and parse the body; 404 means "not found", any other
	/// non-2xx fails.
	async fn peek(
		&self,
		url: &str,
		cancel: &CancellationToken,
	) -> Result<Option<Json>, EngineError> {
		tracing::debug!(url = %url, "GET");
		let req = Request::builder()
			.method("GET")
			.uri(url)
			.body(Vec::new())
			.expect("static request construction");

		self.limiter.acquire().await;
		let fut = self.client.request::<Json>(req);
		let res = tokio::select! {
			_ = cancel.cancelled() => return Err(EngineError::Cancelled),
			res = fut => res,
		};

		match res {
			Ok(obj) => Ok(Some(obj)),
			Err(kube::Error::Api(status)) if status.code == 404 => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	/// Create or overwrite one object.
	async fn reconcile(
		&self,
		r: &ApiResource,
		mut desired: Json,
		cancel: &CancellationToken,
	) -> Result<(), EngineError> {
		let (live, mut method, mut uri) = match self.peek(&r.path_with_name(), cancel).await? {
			Some(live) => (Some(live), "PUT", r.path_with_subresource()),
			None => {
				if !r.subresource.is_empty() {
					return Err(EngineError::ParentResourceMissing);
				}
				(None, "POST", r.path())
			}
		};

		if let Some(live) = &live {
			if self.maybe_recreate(live, &mut desired, r, cancel).await? {
				// The immutable live object is gone (or would be, in
				// dry-run); fall through to create.
				method = "POST";
				uri = r.path();
				if let Some(meta) = desired.pointer_mut("/metadata").and_then(Json::as_object_mut)
				{
					meta.shift_remove("resourceVersion");
				}
			}
		}

		if self.opts.diff || self.opts.dry_run {
			self.print_diff(live.as_ref(), &desired, &r.gvk, &r.name, &r.namespace)?;
		}
		if self.opts.dry_run {
			return Ok(());
		}

		let body = serde_json::to_vec(&desired).map_err(EngineError::Encode)?;
		tracing::debug!(method = method, url = %uri, "sending");
		let req = Request::builder()
			.method(method)
			.uri(&uri)
			.header(http::header::CONTENT_TYPE, "application/json")
			.body(body)
			.expect("static request construction");

		self.limiter.acquire().await;
		let fut = self.client.request::<Json>(req);
		tokio::select! {
			_ = cancel.cancelled() => return Err(EngineError::Cancelled),
			res = fut => { res?; }
		}

		let action = if method == "PUT" { "updated" } else { "created" };
		tracing::info!("{} {}", r, action);
		Ok(())
	}

	/// Run the merge policy; on an immutable update with `--force`, delete
	/// the live object (foreground) and report that a create should follow.
	async fn maybe_recreate(
		&self,
		live: &Json,
		desired: &mut Json,
		r: &ApiResource,
		cancel: &CancellationToken,
	) -> Result<bool, EngineError> {
		match merge_objects(live, desired, &r.gvk) {
			Ok(()) => Ok(false),
			Err(e @ EngineError::Immutable { .. }) if self.opts.force => {
				if self.opts.dry_run {
					println!(
						"\n\n**WARNING** {} {} is immutable and will be deleted and recreated.",
						r.gvk.kind.to_lowercase(),
						maybe_namespaced(&r.name, &r.namespace),
					);
				}
				tracing::warn!(error = %e, "immutable update, deleting for recreation");
				self.delete(r, true, cancel).await?;
				Ok(true)
			}
			Err(e) => Err(e),
		}
	}

	fn print_diff(
		&self,
		live: Option<&Json>,
		head: &Json,
		gvk: &GroupVersionKind,
		name: &str,
		namespace: &str,
	) -> Result<(), EngineError> {
		let mut stdout = std::io::stdout();
		print_unified_diff(
			&mut stdout,
			live,
			head,
			gvk,
			&maybe_namespaced(name, namespace),
			&self.opts.diff_filters,
		)?;
		Ok(())
	}

	fn dynamic_api(&self, r: &ApiResource) -> Api<DynamicObject> {
		let ar = kube::core::ApiResource {
			group: r.gvk.group.clone(),
			version: r.gvk.version.clone(),
			api_version: r.gvk.api_version(),
			kind: r.gvk.kind.clone(),
			plural: r.resource.clone(),
		};
		if r.namespace.is_empty() {
			Api::all_with(self.client.clone(), &ar)
		} else {
			Api::namespaced_with(self.client.clone(), &r.namespace, &ar)
		}
	}
}

/// Enforce the metadata policy before a write: name/namespace equality with
/// the declared values, the heritage label, and the context annotation.
pub fn set_metadata(
	ctx: &Json,
	name: &str,
	namespace: &str,
	doc: &mut Json,
) -> Result<(), EngineError> {
	let declared_name = doc.pointer("/metadata/name").and_then(Json::as_str).unwrap_or_default();
	if !declared_name.is_empty() && declared_name != name {
		return Err(EngineError::NameMismatch {
			arg: name.to_string(),
			declared: declared_name.to_string(),
		});
	}

	if !namespace.is_empty() {
		let declared_ns = doc
			.pointer("/metadata/namespace")
			.and_then(Json::as_str)
			.unwrap_or_default();
		if !declared_ns.is_empty() && declared_ns != namespace {
			return Err(EngineError::NamespaceMismatch {
				arg: namespace.to_string(),
				declared: declared_ns.to_string(),
			});
		}
	}

	let obj = doc.as_object_mut().ok_or(DecodeError::NotAnObject)?;
	let meta = obj
		.entry("metadata")
		.or_insert_with(|| Json::Object(Default::default()));
	let meta = meta.as_object_mut().ok_or(DecodeError::NotAnObject)?;

	meta.insert("name".into(), Json::String(name.to_string()));
	if !namespace.is_empty() {
		meta.insert("namespace".into(), Json::String(namespace.to_string()));
	}

	let labels = meta
		.entry("labels")
		.or_insert_with(|| Json::Object(Default::default()));
	if let Some(labels) = labels.as_object_mut() {
		labels.insert(HERITAGE_LABEL.into(), Json::String(HERITAGE_VALUE.into()));
	}

	let annotations = meta
		.entry("annotations")
		.or_insert_with(|| Json::Object(Default::default()));
	if let Some(annotations) = annotations.as_object_mut() {
		let ctx_json = serde_json::to_string(ctx).map_err(EngineError::Encode)?;
		annotations.insert(CONTEXT_ANNOTATION.into(), Json::String(ctx_json));
	}

	Ok(())
}

/// Patch the desired object with fields the cluster must retain, and detect
/// immutable updates.
pub fn merge_objects(
	live: &Json,
	desired: &mut Json,
	gvk: &GroupVersionKind,
) -> Result<(), EngineError> {
	if gvk.group.is_empty() && gvk.kind == "Service" {
		// clusterIP is controller-assigned; mutating it is denied.
		if let Some(cluster_ip) = live.pointer("/spec/clusterIP").cloned() {
			if let Some(spec) = desired.pointer_mut("/spec").and_then(Json::as_object_mut) {
				spec.insert("clusterIP".into(), cluster_ip);
			}
		}

		let got = live
			.pointer("/spec/healthCheckNodePort")
			.and_then(Json::as_i64)
			.unwrap_or(0);
		let want = desired
			.pointer("/spec/healthCheckNodePort")
			.and_then(Json::as_i64)
			.unwrap_or(0);
		if want != 0 && got != 0 && want != got {
			return Err(immutable(".spec.healthCheckNodePort", gvk));
		}
		if got != 0 {
			if let Some(spec) = desired.pointer_mut("/spec").and_then(Json::as_object_mut) {
				spec.insert("healthCheckNodePort".into(), Json::from(got));
			}
		}
	}

	if gvk.group == "rbac.authorization.k8s.io" && gvk.kind == "ClusterRoleBinding" {
		for field in ["apiGroup", "kind", "name"] {
			let live_v = live.pointer(&format!("/roleRef/{}", field));
			let want_v = desired.pointer(&format!("/roleRef/{}", field));
			if live_v != want_v {
				return Err(immutable("roleRef", gvk));
			}
		}
	}

	// Updates must carry the live resourceVersion for optimistic concurrency.
	if let Some(rv) = live
		.pointer("/metadata/resourceVersion")
		.and_then(Json::as_str)
		.filter(|rv| !rv.is_empty())
	{
		if let Some(meta) = desired.pointer_mut("/metadata").and_then(Json::as_object_mut) {
			meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
		}
	}

	Ok(())
}

fn immutable(attribute: &str, gvk: &GroupVersionKind) -> EngineError {
	EngineError::Immutable {
		attribute: attribute.to_string(),
		resource: format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind),
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use serde_json::json;

	use super::*;

	fn svc_gvk() -> GroupVersionKind {
		GroupVersionKind::gvk("", "v1", "Service")
	}

	fn crb_gvk() -> GroupVersionKind {
		GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding")
	}

	#[test]
	fn test_set_metadata_writes_identity_and_heritage() {
		let ctx = json!({"cluster": "minikube"});
		let mut doc = json!({"apiVersion": "v1", "kind": "ConfigMap"});
		set_metadata(&ctx, "cm", "ns", &mut doc).unwrap();

		assert_eq!(doc.pointer("/metadata/name").unwrap(), "cm");
		assert_eq!(doc.pointer("/metadata/namespace").unwrap(), "ns");
		assert_eq!(
			doc.pointer(&format!("/metadata/labels/{}", HERITAGE_LABEL)).unwrap(),
			HERITAGE_VALUE
		);

		let ann = doc
			.pointer(&format!("/metadata/annotations/{}", CONTEXT_ANNOTATION.replace('/', "~1")))
			.and_then(Json::as_str)
			.unwrap();
		let round_trip: Json = serde_json::from_str(ann).unwrap();
		assert_eq!(round_trip, ctx);
	}

	#[test]
	fn test_set_metadata_preserves_user_labels() {
		let mut doc = json!({
			"metadata": {"labels": {"app": "web"}}
		});
		set_metadata(&json!({}), "x", "", &mut doc).unwrap();
		assert_eq!(doc.pointer("/metadata/labels/app").unwrap(), "web");
		assert_eq!(
			doc.pointer(&format!("/metadata/labels/{}", HERITAGE_LABEL)).unwrap(),
			HERITAGE_VALUE
		);
	}

	#[test]
	fn test_set_metadata_name_mismatch() {
		let mut doc = json!({"metadata": {"name": "other"}});
		let err = set_metadata(&json!({}), "mine", "", &mut doc).unwrap_err();
		assert_matches!(err, EngineError::NameMismatch { arg, declared }
			if arg == "mine" && declared == "other");
	}

	#[test]
	fn test_set_metadata_namespace_mismatch() {
		let mut doc = json!({"metadata": {"name": "x", "namespace": "a"}});
		let err = set_metadata(&json!({}), "x", "b", &mut doc).unwrap_err();
		assert_matches!(err, EngineError::NamespaceMismatch { .. });

		// An empty caller namespace skips the check.
		let mut doc = json!({"metadata": {"name": "x", "namespace": "a"}});
		set_metadata(&json!({}), "x", "", &mut doc).unwrap();
	}

	#[test]
	fn test_merge_copies_resource_version() {
		let live = json!({"metadata": {"resourceVersion": "42"}});
		let mut desired = json!({"metadata": {"name": "x"}});
		merge_objects(&live, &mut desired, &GroupVersionKind::gvk("", "v1", "Pod")).unwrap();
		assert_eq!(desired.pointer("/metadata/resourceVersion").unwrap(), "42");
	}

	#[test]
	fn test_merge_copies_cluster_ip() {
		let live = json!({"spec": {"clusterIP": "10.0.0.1"}});
		let mut desired = json!({"spec": {"ports": []}});
		merge_objects(&live, &mut desired, &svc_gvk()).unwrap();
		assert_eq!(desired.pointer("/spec/clusterIP").unwrap(), "10.0.0.1");
	}

	#[test]
	fn test_merge_health_check_node_port() {
		// Desired zero adopts the live port.
		let live = json!({"spec": {"healthCheckNodePort": 31000}});
		let mut desired = json!({"spec": {}});
		merge_objects(&live, &mut desired, &svc_gvk()).unwrap();
		assert_eq!(desired.pointer("/spec/healthCheckNodePort").unwrap(), 31000);

		// Conflicting non-zero ports are immutable.
		let mut desired = json!({"spec": {"healthCheckNodePort": 32000}});
		let err = merge_objects(&live, &mut desired, &svc_gvk()).unwrap_err();
		assert_matches!(err, EngineError::Immutable { attribute, .. }
			if attribute == ".spec.healthCheckNodePort");
	}

	#[test]
	fn test_merge_cluster_role_binding_role_ref() {
		let live = json!({"roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "admin"}});
		let mut desired = live.clone();
		merge_objects(&live, &mut desired, &crb_gvk()).unwrap();

		let mut desired = json!({"roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "edit"}});
		let err = merge_objects(&live, &mut desired, &crb_gvk()).unwrap_err();
		assert_matches!(err, EngineError::Immutable { attribute, .. } if attribute == "roleRef");
	}
}
