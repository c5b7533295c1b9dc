//! Cluster vendors: script-visible constructors (`gke(...)`, `onprem(...)`)
//! whose values carry cluster identity and can produce a REST client
//! configuration for their cluster.

pub mod gke;
pub mod onprem;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value as Json;
use starlark::environment::GlobalsBuilder;
use starlark::values::{Value, ValueLike};

use crate::context::CtxData;

/// CLI-level configuration consumed by the vendor constructors.
#[derive(Debug, Clone, Default)]
pub struct CloudConfig {
	/// Cloud service-account JSON for GKE auth (`--sa_key`).
	pub sa_key: Option<PathBuf>,
	/// On-prem kubeconfig path (`--kubeconfig`); takes precedence over a
	/// kubeconfig named by the vendor value itself.
	pub kubeconfig: Option<PathBuf>,
	pub user_agent: String,
}

/// A Kubernetes vendor: produces a REST client configuration and the addon
/// context for its cluster.
#[async_trait]
pub trait KubernetesVendor: Send + Sync {
	/// Build the REST client configuration for this cluster.
	async fn kube_config(&self) -> anyhow::Result<kube::Config>;

	/// The cluster context extended with user-supplied pairs. The vendor's
	/// own fields are authoritative cluster identity.
	fn addon_ctx(&self, more: &IndexMap<String, String>) -> Arc<CtxData>;

	/// Display identity, the `cluster` field by convention.
	fn cluster_name(&self) -> String;
}

/// Merge user pairs into vendor fields, vendor fields first.
pub(crate) fn merged_ctx(
	fields: &IndexMap<String, Json>,
	more: &IndexMap<String, String>,
) -> Arc<CtxData> {
	let mut attrs = fields.clone();
	for (k, v) in more {
		attrs.insert(k.clone(), Json::String(v.clone()));
	}
	Arc::new(std::sync::RwLock::new(attrs))
}

/// Recover a vendor from a `clusters()` return item, or None when the value
/// is not a cluster-vendor object.
pub fn vendor_from_value(v: Value) -> Option<Box<dyn KubernetesVendor>> {
	if let Some(g) = v.downcast_ref::<gke::GkeValue>() {
		return Some(Box::new(g.to_vendor()));
	}
	if let Some(o) = v.downcast_ref::<onprem::OnPremValue>() {
		return Some(Box::new(o.to_vendor()));
	}
	None
}

/// Register the vendor constructors.
pub fn register(builder: &mut GlobalsBuilder) {
	gke::register(builder);
	onprem::register(builder);
}
