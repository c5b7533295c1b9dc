//! The `addon()` builtin and the addon lifecycle: load the entry module
//! once, then drive its `install`/`remove` callbacks.

use std::fmt;
use std::sync::Arc;

use allocative::Allocative;
use anyhow::{anyhow, bail};
use indexmap::IndexMap;
use serde_json::Value as Json;
use starlark::any::ProvidesStaticType;
use starlark::environment::{FrozenModule, GlobalsBuilder};
use starlark::starlark_module;
use starlark::starlark_simple_value;
use starlark::values::dict::DictRef;
use starlark::values::{starlark_value, Heap, NoSerialize, StarlarkValue, Value, ValueLike};

use crate::bridge::{call_with_ctx, BridgeExtra};
use crate::context::{CtxData, SkyCtx};
use crate::loader::ModulesLoader;
use crate::values::value_to_json;

/// Script value produced by `addon(name, path, ctx)`.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct AddonValue {
	pub name: String,
	pub path: String,
	#[allocative(skip)]
	pub ctx: IndexMap<String, Json>,
}

starlark_simple_value!(AddonValue);

impl fmt::Display for AddonValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<addon: {}>", self.name)
	}
}

#[starlark_value(type = "addon")]
impl<'v> StarlarkValue<'v> for AddonValue {
	fn get_attr(&self, attribute: &str, heap: &'v Heap) -> Option<Value<'v>> {
		match attribute {
			"name" => Some(heap.alloc(self.name.as_str())),
			"path" => Some(heap.alloc(self.path.as_str())),
			_ => None,
		}
	}

	fn dir_attr(&self) -> Vec<String> {
		vec!["name".to_string(), "path".to_string()]
	}
}

/// Register the `addon` constructor.
pub fn register(builder: &mut GlobalsBuilder) {
	addon_builtin(builder);
}

#[starlark_module]
fn addon_builtin(builder: &mut GlobalsBuilder) {
	/// Construct an addon from its name, entry file path, and context. The
	/// context may be a ctx object or a dict.
	fn addon<'v>(
		name: &str,
		path: &str,
		ctx: Option<Value<'v>>,
	) -> anyhow::Result<AddonValue> {
		let ctx = match ctx {
			None => IndexMap::new(),
			Some(v) => {
				if let Some(sky) = v.downcast_ref::<SkyCtx>() {
					match sky.to_json() {
						Json::Object(map) => map.into_iter().collect(),
						_ => IndexMap::new(),
					}
				} else if let Some(dict) = DictRef::from_value(v) {
					let mut out = IndexMap::new();
					for (k, item) in dict.iter() {
						let key = k.unpack_str().ok_or_else(|| {
							anyhow!("{} context key not a string (got a {})", k, k.get_type())
						})?;
						out.insert(key.to_string(), value_to_json(item)?);
					}
					out
				} else {
					bail!(
						"unexpected context object (want either ctx or dict), got: {}",
						v.get_type()
					);
				}
			}
		};

		Ok(AddonValue {
			name: name.to_string(),
			path: path.to_string(),
			ctx,
		})
	}
}

/// A loaded addon on the native side of the bridge.
pub struct Addon {
	pub name: String,
	pub path: String,
	ctx: Arc<CtxData>,
	module: Option<FrozenModule>,
}

impl Addon {
	/// Recover an addon from an `addons()` return item.
	pub fn from_value(v: Value) -> Option<Self> {
		let value = v.downcast_ref::<AddonValue>()?;
		Some(Self {
			name: value.name.clone(),
			path: value.path.clone(),
			ctx: Arc::new(std::sync::RwLock::new(value.ctx.clone())),
			module: None,
		})
	}

	pub fn display_pretty(&self) -> String {
		format!("{} ({})", self.name, self.path)
	}

	/// Shared context storage handed to install/remove executions.
	pub fn ctx(&self) -> Arc<CtxData> {
		Arc::clone(&self.ctx)
	}

	/// Load and execute the addon's entry module. Remote-module versions
	/// surface in the context as `addon_version`.
	pub fn load(&mut self, loader: &ModulesLoader) -> anyhow::Result<()> {
		let module = loader.load_module(&self.path)?;
		if let Some(version) = loader.module_version(&self.path) {
			self.ctx
				.write()
				.expect("context lock poisoned")
				.insert("addon_version".to_string(), Json::String(version));
		}
		self.module = Some(module);
		Ok(())
	}

	/// Source snapshot of every module loaded for this addon.
	pub fn loaded_modules(&self, loader: &ModulesLoader) -> std::collections::HashMap<String, String> {
		loader.loaded_sources()
	}

	pub fn install(&self, extra: &BridgeExtra, loader: &ModulesLoader) -> anyhow::Result<()> {
		self.call_hook("install", extra, loader)
	}

	pub fn remove(&self, extra: &BridgeExtra, loader: &ModulesLoader) -> anyhow::Result<()> {
		self.call_hook("remove", extra, loader)
	}

	fn call_hook(
		&self,
		hook: &str,
		extra: &BridgeExtra,
		loader: &ModulesLoader,
	) -> anyhow::Result<()> {
		let module = self
			.module
			.as_ref()
			.ok_or_else(|| anyhow!("addon `{}' is not loaded", self.name))?;
		tracing::info!(addon = %self.name, hook = hook, "running addon hook");
		call_with_ctx(module, hook, self.ctx(), extra, loader, |_| Ok(()))
			.map_err(|e| anyhow!("{}: {}", self.display_pretty(), e))
	}
}

impl fmt::Display for Addon {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<addon: {}>", self.name)
	}
}
