//! On-prem clusters: kubeconfig-file based REST configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use allocative::Allocative;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use indexmap::IndexMap;
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde_json::Value as Json;
use starlark::any::ProvidesStaticType;
use starlark::collections::SmallMap;
use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::starlark_simple_value;
use starlark::values::{starlark_value, Heap, NoSerialize, StarlarkValue, Value};

use super::{merged_ctx, CloudConfig, KubernetesVendor};
use crate::bridge::BridgeExtra;
use crate::context::CtxData;
use crate::values::{json_to_value, value_to_json};

/// Script value produced by `onprem(**kwargs)`.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct OnPremValue {
	#[allocative(skip)]
	fields: IndexMap<String, Json>,
	#[allocative(skip)]
	kubeconfig: Option<PathBuf>,
}

starlark_simple_value!(OnPremValue);

impl OnPremValue {
	pub fn to_vendor(&self) -> OnPremVendor {
		OnPremVendor {
			fields: self.fields.clone(),
			kubeconfig: self.kubeconfig.clone(),
		}
	}
}

impl fmt::Display for OnPremValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<onprem: {:?}>", self.fields)
	}
}

#[starlark_value(type = "onprem")]
impl<'v> StarlarkValue<'v> for OnPremValue {
	fn get_attr(&self, attribute: &str, heap: &'v Heap) -> Option<Value<'v>> {
		match self.fields.get(attribute) {
			Some(v) => Some(json_to_value(heap, v)),
			None => Some(Value::new_none()),
		}
	}

	fn has_attr(&self, _attribute: &str, _heap: &'v Heap) -> bool {
		true
	}
}

/// Native on-prem vendor.
pub struct OnPremVendor {
	fields: IndexMap<String, Json>,
	kubeconfig: Option<PathBuf>,
}

#[async_trait]
impl KubernetesVendor for OnPremVendor {
	async fn kube_config(&self) -> anyhow::Result<kube::Config> {
		// The --kubeconfig flag wins over a path named by the vendor value.
		let path = self
			.kubeconfig
			.clone()
			.or_else(|| {
				self.fields
					.get("kubeconfig")
					.and_then(Json::as_str)
					.map(PathBuf::from)
			})
			.ok_or_else(|| anyhow!("onprem cluster requires a kubeconfig path"))?;

		let kc = Kubeconfig::read_from(&path)
			.with_context(|| format!("reading kubeconfig {}", path.display()))?;
		let config = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
			.await
			.context("building client config from kubeconfig")?;
		Ok(config)
	}

	fn addon_ctx(&self, more: &IndexMap<String, String>) -> Arc<CtxData> {
		merged_ctx(&self.fields, more)
	}

	fn cluster_name(&self) -> String {
		self.fields
			.get("cluster")
			.and_then(Json::as_str)
			.unwrap_or("onprem")
			.to_string()
	}
}

/// Register the `onprem` constructor.
pub fn register(builder: &mut GlobalsBuilder) {
	onprem_builtin(builder);
}

#[starlark_module]
fn onprem_builtin(builder: &mut GlobalsBuilder) {
	fn onprem<'v>(
		#[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<OnPremValue> {
		let cloud = BridgeExtra::from_eval(eval)
			.map(|e| e.caps.cloud.clone())
			.unwrap_or_else(|_| CloudConfig::default());
		Ok(OnPremValue {
			fields: kwargs_to_fields(&kwargs)?,
			kubeconfig: cloud.kubeconfig,
		})
	}
}

pub(crate) fn kwargs_to_fields(
	kwargs: &SmallMap<String, Value>,
) -> anyhow::Result<IndexMap<String, Json>> {
	let mut fields = IndexMap::new();
	for (key, v) in kwargs.iter() {
		fields.insert(key.clone(), value_to_json(*v)?);
	}
	Ok(fields)
}
