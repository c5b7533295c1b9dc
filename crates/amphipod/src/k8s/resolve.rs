//! API resource discovery and resolution.
//!
//! The cache is built from the cluster's discovery API once per session and
//! answers lookups by GroupVersionKind, by (api_group, resource) strings, or
//! by a manifest's declared apiVersion/kind. Ambiguous matches fail rather
//! than picking one.

use kube::{
	core::GroupVersionKind,
	discovery::{Discovery, Scope},
	Client,
};
use thiserror::Error;
use tracing::instrument;

/// Errors produced while resolving a resource binding.
#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("discovery failed")]
	Discovery(#[source] Box<kube::Error>),

	#[error("no kind match for {hint}")]
	NoKindMatch { hint: String },

	#[error("ambiguous resource `{resource}': matches {candidates}")]
	Ambiguous { resource: String, candidates: String },

	#[error("specified namespace `{namespace}' doesn't match Namespace name `{name}'")]
	NamespaceNameMismatch { namespace: String, name: String },
}

/// One discovered resource binding.
#[derive(Debug, Clone)]
pub struct DiscoveredResource {
	pub group: String,
	pub version: String,
	pub kind: String,
	/// Plural, lowercase resource name.
	pub plural: String,
	pub namespaced: bool,
}

impl DiscoveredResource {
	fn gvk(&self) -> GroupVersionKind {
		GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
	}

	/// True if `resource` names this binding by plural, singular lowercase
	/// kind, or kind.
	fn matches_resource(&self, resource: &str) -> bool {
		resource == self.plural || resource == self.kind || resource == self.kind.to_lowercase()
	}
}

/// Cached discovery results for one cluster session.
#[derive(Debug, Clone, Default)]
pub struct ResourceCache {
	entries: Vec<DiscoveredResource>,
}

impl ResourceCache {
	/// Build the cache by querying the cluster's discovery API. Iterates all
	/// served versions, not just recommended ones, so manifests pinned to
	/// older versions still resolve.
	#[instrument(skip_all)]
	pub async fn build(client: &Client) -> Result<Self, ResolveError> {
		let discovery = Discovery::new(client.clone())
			.run()
			.await
			.map_err(|e| ResolveError::Discovery(Box::new(e)))?;

		let mut entries = Vec::new();
		for group in discovery.groups() {
			for ver in group.versions() {
				for (ar, caps) in group.versioned_resources(ver) {
					entries.push(DiscoveredResource {
						group: ar.group.clone(),
						version: ar.version.clone(),
						kind: ar.kind.clone(),
						plural: ar.plural.clone(),
						namespaced: matches!(caps.scope, Scope::Namespaced),
					});
				}
			}
		}
		tracing::debug!(resource_count = entries.len(), "built discovery cache");
		Ok(Self { entries })
	}

	/// Build a cache from a static entry list (used by tests).
	pub fn from_entries(entries: Vec<DiscoveredResource>) -> Self {
		Self { entries }
	}

	/// Look up the binding for an exact GroupVersionKind.
	pub fn for_gvk(&self, gvk: &GroupVersionKind) -> Result<&DiscoveredResource, ResolveError> {
		self.entries
			.iter()
			.find(|e| e.group == gvk.group && e.version == gvk.version && e.kind == gvk.kind)
			.ok_or_else(|| ResolveError::NoKindMatch {
				hint: format!("{}/{}", gvk.api_version(), gvk.kind),
			})
	}

	/// Look up a binding for a (group, kind) pair, preferring an exact
	/// version match when `version` is non-empty.
	pub fn for_kind(
		&self,
		group: &str,
		version: &str,
		kind: &str,
	) -> Result<&DiscoveredResource, ResolveError> {
		if !version.is_empty() {
			if let Some(e) = self
				.entries
				.iter()
				.find(|e| e.group == group && e.version == version && e.kind == kind)
			{
				return Ok(e);
			}
		}
		self.entries
			.iter()
			.find(|e| e.group == group && e.kind == kind)
			.ok_or_else(|| ResolveError::NoKindMatch {
				hint: format!("{}/{}/{}", group, version, kind),
			})
	}

	/// Look up a binding from (api_group, resource) strings. `api_group` may
	/// be empty, `group`, or `group/version` (a version pins the lookup).
	/// Fails when several distinct kinds match.
	pub fn for_resource(
		&self,
		api_group: &str,
		resource: &str,
	) -> Result<&DiscoveredResource, ResolveError> {
		let (group, version) = match api_group.split_once('/') {
			Some((g, v)) => (Some(g), Some(v)),
			None if api_group.is_empty() => (None, None),
			None => (Some(api_group), None),
		};

		let matches: Vec<&DiscoveredResource> = self
			.entries
			.iter()
			.filter(|e| {
				group.is_none_or(|g| e.group == g)
					&& version.is_none_or(|v| e.version == v)
					&& e.matches_resource(resource)
			})
			.collect();

		let mut kinds: Vec<(&str, &str)> = matches.iter().map(|e| (e.group.as_str(), e.kind.as_str())).collect();
		kinds.sort();
		kinds.dedup();

		match kinds.len() {
			0 => Err(ResolveError::NoKindMatch {
				hint: format!("{}/{}", api_group, resource),
			}),
			1 => Ok(matches[0]),
			_ => Err(ResolveError::Ambiguous {
				resource: resource.to_string(),
				candidates: kinds
					.iter()
					.map(|(g, k)| if g.is_empty() { k.to_string() } else { format!("{}.{}", k, g) })
					.collect::<Vec<_>>()
					.join(", "),
			}),
		}
	}
}

/// Fully resolved identity of one Kubernetes object as the engine operates
/// on it.
#[derive(Debug, Clone)]
pub struct ApiResource {
	pub gvk: GroupVersionKind,
	pub name: String,
	/// Empty for cluster-scoped objects.
	pub namespace: String,
	/// Plural, lowercase resource name.
	pub resource: String,
	/// Optional subresource suffix such as "status" or "approval".
	pub subresource: String,
	pub cluster_scoped: bool,
}

impl ApiResource {
	/// Resolve from an object's declared GroupVersionKind, with an optional
	/// `api_group` hint winning over the declared group.
	pub fn for_object(
		cache: &ResourceCache,
		name: &str,
		namespace: &str,
		api_group: &str,
		subresource: &str,
		declared: &GroupVersionKind,
	) -> Result<Self, ResolveError> {
		let group = if api_group.is_empty() { declared.group.as_str() } else { api_group };
		let entry = cache.for_kind(group, &declared.version, &declared.kind)?;
		Self::from_entry(entry, name, namespace, subresource, false)
	}

	/// Resolve from a manifest's declared GroupVersionKind (authoritative).
	pub fn for_kind(
		cache: &ResourceCache,
		name: &str,
		namespace: &str,
		subresource: &str,
		gvk: &GroupVersionKind,
	) -> Result<Self, ResolveError> {
		let entry = cache.for_gvk(gvk)?;
		Self::from_entry(entry, name, namespace, subresource, true)
	}

	/// Resolve from (api_group, resource) strings as used by
	/// `kube.get`/`kube.exists`/`kube.delete`.
	pub fn for_resource(
		cache: &ResourceCache,
		name: &str,
		namespace: &str,
		api_group: &str,
		resource: &str,
	) -> Result<Self, ResolveError> {
		let entry = cache.for_resource(api_group, resource)?;
		Self::from_entry(entry, name, namespace, "", false)
	}

	/// `scope_namespace` drops the namespace argument for cluster-scoped
	/// kinds before validation (the permissive `put_yaml` path); otherwise
	/// the caller's namespace is kept so mismatches are caught.
	fn from_entry(
		entry: &DiscoveredResource,
		name: &str,
		namespace: &str,
		subresource: &str,
		scope_namespace: bool,
	) -> Result<Self, ResolveError> {
		let namespace = if scope_namespace && !entry.namespaced { "" } else { namespace };
		let r = Self {
			gvk: entry.gvk(),
			name: name.to_string(),
			namespace: namespace.to_string(),
			resource: entry.plural.clone(),
			subresource: subresource.to_string(),
			cluster_scoped: !entry.namespaced,
		};
		r.validate()
	}

	fn validate(self) -> Result<Self, ResolveError> {
		if self.gvk.kind == "Namespace" && !self.namespace.is_empty() && self.name != self.namespace
		{
			return Err(ResolveError::NamespaceNameMismatch {
				namespace: self.namespace,
				name: self.name,
			});
		}
		Ok(self)
	}

	fn resource_segments(&self) -> Vec<&str> {
		let mut segments = Vec::with_capacity(6);
		if self.gvk.group.is_empty() {
			segments.push("api");
			segments.push(self.gvk.version.as_str());
		} else {
			segments.push("apis");
			segments.push(self.gvk.group.as_str());
			segments.push(self.gvk.version.as_str());
		}

		if !self.namespace.is_empty() && !self.cluster_scoped {
			segments.push("namespaces");
			segments.push(self.namespace.as_str());
		}

		if !self.resource.is_empty() {
			segments.push(self.resource.as_str());
		}

		segments
	}

	/// Collection URI (create target).
	pub fn path(&self) -> String {
		format!("/{}", self.resource_segments().join("/"))
	}

	/// Name-targeted URI (probe/update target).
	pub fn path_with_name(&self) -> String {
		let mut p = self.path();
		if !self.name.is_empty() {
			p.push('/');
			p.push_str(&self.name);
		}
		p
	}

	/// Name-targeted URI with the subresource suffix, when present.
	pub fn path_with_subresource(&self) -> String {
		let mut p = self.path_with_name();
		if !self.subresource.is_empty() {
			p.push('/');
			p.push_str(&self.subresource);
		}
		p
	}

	/// Human tag: ``kind.group `ns/name'``.
	pub fn display(&self) -> String {
		format!(
			"{}{} `{}'",
			self.gvk.kind.to_lowercase(),
			maybe_core(&self.gvk.group),
			maybe_namespaced(&self.name, &self.namespace),
		)
	}
}

impl std::fmt::Display for ApiResource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.display())
	}
}

/// `.group` suffix for a named group, `.v1` for the core group.
pub fn maybe_core(group: &str) -> String {
	if group.is_empty() {
		".v1".to_string()
	} else {
		format!(".{}", group)
	}
}

/// `ns/name` when a namespace is present, bare `name` otherwise.
pub fn maybe_namespaced(name: &str, namespace: &str) -> String {
	if namespace.is_empty() {
		name.to_string()
	} else {
		format!("{}/{}", namespace, name)
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	fn test_cache() -> ResourceCache {
		ResourceCache::from_entries(vec![
			DiscoveredResource {
				group: "".into(),
				version: "v1".into(),
				kind: "Pod".into(),
				plural: "pods".into(),
				namespaced: true,
			},
			DiscoveredResource {
				group: "".into(),
				version: "v1".into(),
				kind: "Namespace".into(),
				plural: "namespaces".into(),
				namespaced: false,
			},
			DiscoveredResource {
				group: "".into(),
				version: "v1".into(),
				kind: "Event".into(),
				plural: "events".into(),
				namespaced: true,
			},
			DiscoveredResource {
				group: "events.k8s.io".into(),
				version: "v1".into(),
				kind: "Event".into(),
				plural: "events".into(),
				namespaced: true,
			},
			DiscoveredResource {
				group: "apps".into(),
				version: "v1".into(),
				kind: "Deployment".into(),
				plural: "deployments".into(),
				namespaced: true,
			},
		])
	}

	#[test]
	fn test_core_pod_paths() {
		let cache = test_cache();
		let r = ApiResource::for_resource(&cache, "foo", "bar", "", "pod").unwrap();
		assert_eq!(r.path(), "/api/v1/namespaces/bar/pods");
		assert_eq!(r.path_with_name(), "/api/v1/namespaces/bar/pods/foo");
	}

	#[test]
	fn test_group_resource_paths() {
		let cache = test_cache();
		let r = ApiResource::for_resource(&cache, "test", "default", "apps", "deployment").unwrap();
		assert_eq!(
			r.path_with_name(),
			"/apis/apps/v1/namespaces/default/deployments/test"
		);
	}

	#[test]
	fn test_version_pinning() {
		let cache = test_cache();
		let r = ApiResource::for_resource(&cache, "x", "", "apps/v1", "deployments").unwrap();
		assert_eq!(r.gvk.version, "v1");
	}

	#[test]
	fn test_cluster_scoped_namespace() {
		let cache = test_cache();
		let r = ApiResource::for_resource(&cache, "kube-system", "", "", "namespace").unwrap();
		assert!(r.cluster_scoped);
		assert_eq!(r.path_with_name(), "/api/v1/namespaces/kube-system");
	}

	#[test]
	fn test_subresource_path() {
		let cache = test_cache();
		let gvk = GroupVersionKind::gvk("", "v1", "Pod");
		let r = ApiResource::for_object(&cache, "foo", "bar", "", "status", &gvk).unwrap();
		assert_eq!(
			r.path_with_subresource(),
			"/api/v1/namespaces/bar/pods/foo/status"
		);
	}

	#[test]
	fn test_ambiguous_resource_fails() {
		let cache = test_cache();
		let err = ApiResource::for_resource(&cache, "x", "", "", "events").unwrap_err();
		assert_matches!(err, ResolveError::Ambiguous { .. });
	}

	#[test]
	fn test_no_kind_match() {
		let cache = test_cache();
		let err = ApiResource::for_resource(&cache, "x", "", "", "gizmos").unwrap_err();
		assert_matches!(err, ResolveError::NoKindMatch { .. });
	}

	#[test]
	fn test_namespace_name_equality() {
		let cache = test_cache();
		let gvk = GroupVersionKind::gvk("", "v1", "Namespace");
		let r = ApiResource::for_object(&cache, "foo", "", "", "", &gvk).unwrap();
		assert_eq!(r.path_with_name(), "/api/v1/namespaces/foo");

		// Matching name and namespace is allowed; the namespace segment is
		// still skipped because the kind is cluster-scoped.
		let r = ApiResource::for_object(&cache, "foo", "foo", "", "", &gvk).unwrap();
		assert_eq!(r.path_with_name(), "/api/v1/namespaces/foo");

		let err = ApiResource::for_object(&cache, "foo", "bar", "", "", &gvk).unwrap_err();
		assert_matches!(err, ResolveError::NamespaceNameMismatch { .. });

		// The declared-kind path scopes the namespace away instead.
		let r = ApiResource::for_kind(&cache, "foo", "bar", "", &gvk).unwrap();
		assert_eq!(r.namespace, "");
	}

	#[test]
	fn test_api_group_hint_wins() {
		let cache = test_cache();
		let gvk = GroupVersionKind::gvk("wrong", "v1", "Deployment");
		let r = ApiResource::for_object(&cache, "d", "ns", "apps", "", &gvk).unwrap();
		assert_eq!(r.gvk.group, "apps");
		assert_eq!(r.resource, "deployments");
	}
}
