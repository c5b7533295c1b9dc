//! The field-addressable context object carried through scripts.
//!
//! Two well-known contexts exist: the cluster context built from `clusters()`
//! return values and the addon context extending it with user-supplied
//! `key=value` pairs. Missing fields read as `None`, never an error.

use std::fmt;
use std::sync::{Arc, RwLock};

use allocative::Allocative;
use indexmap::IndexMap;
use serde_json::Value as Json;
use starlark::any::ProvidesStaticType;
use starlark::starlark_simple_value;
use starlark::values::{starlark_value, Heap, NoSerialize, StarlarkValue, Value};

use crate::values::{json_to_value, value_to_json};

/// Shared, ordered attribute storage behind a context value.
pub type CtxData = RwLock<IndexMap<String, Json>>;

/// Script-visible context object. Attribute reads fall back to `None`;
/// attribute writes land in the shared storage so native code observes them.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct SkyCtx {
	#[allocative(skip)]
	attrs: Arc<CtxData>,
}

starlark_simple_value!(SkyCtx);

impl SkyCtx {
	pub fn new() -> Self {
		Self::from_map(IndexMap::new())
	}

	pub fn from_map(attrs: IndexMap<String, Json>) -> Self {
		Self {
			attrs: Arc::new(RwLock::new(attrs)),
		}
	}

	/// Wrap existing shared storage; mutations are visible to every holder.
	pub fn from_shared(attrs: Arc<CtxData>) -> Self {
		Self { attrs }
	}

	pub fn shared(&self) -> Arc<CtxData> {
		Arc::clone(&self.attrs)
	}

	pub fn set(&self, name: &str, value: Json) {
		self.attrs
			.write()
			.expect("context lock poisoned")
			.insert(name.to_string(), value);
	}

	pub fn get(&self, name: &str) -> Option<Json> {
		self.attrs.read().expect("context lock poisoned").get(name).cloned()
	}

	/// Snapshot the attributes as a JSON object in insertion order.
	pub fn to_json(&self) -> Json {
		let attrs = self.attrs.read().expect("context lock poisoned");
		Json::Object(attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
	}
}

impl Default for SkyCtx {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for SkyCtx {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<ctx: {}>", self.to_json())
	}
}

#[starlark_value(type = "ctx")]
impl<'v> StarlarkValue<'v> for SkyCtx {
	fn get_attr(&self, attribute: &str, heap: &'v Heap) -> Option<Value<'v>> {
		match self.get(attribute) {
			Some(v) => Some(json_to_value(heap, &v)),
			None => Some(Value::new_none()),
		}
	}

	fn has_attr(&self, _attribute: &str, _heap: &'v Heap) -> bool {
		true
	}

	fn set_attr(&self, attribute: &str, new_value: Value<'v>) -> starlark::Result<()> {
		self.set(attribute, value_to_json(new_value)?);
		Ok(())
	}

	fn dir_attr(&self) -> Vec<String> {
		let mut names: Vec<String> = self
			.attrs
			.read()
			.expect("context lock poisoned")
			.keys()
			.cloned()
			.collect();
		names.sort();
		names
	}
}

/// Snapshot shared context storage as a JSON object.
pub fn ctx_data_to_json(data: &CtxData) -> Json {
	let attrs = data.read().expect("context lock poisoned");
	Json::Object(attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_missing_attr_reads_as_none() {
		let ctx = SkyCtx::new();
		let heap = Heap::new();
		let v = ctx.get_attr("cluster", &heap).unwrap();
		assert!(v.is_none());
	}

	#[test]
	fn test_set_then_get() {
		let ctx = SkyCtx::new();
		ctx.set("cluster", json!("minikube"));
		assert_eq!(ctx.get("cluster"), Some(json!("minikube")));
		assert_eq!(ctx.to_json(), json!({"cluster": "minikube"}));
	}

	#[test]
	fn test_shared_storage_is_visible_to_all_holders() {
		let ctx = SkyCtx::new();
		let other = SkyCtx::from_shared(ctx.shared());
		other.set("addon_version", json!("abc123"));
		assert_eq!(ctx.get("addon_version"), Some(json!("abc123")));
	}

	#[test]
	fn test_insertion_order_preserved() {
		let ctx = SkyCtx::new();
		ctx.set("b", json!(1.0));
		ctx.set("a", json!(2.0));
		assert_eq!(
			serde_json::to_string(&ctx.to_json()).unwrap(),
			r#"{"b":1.0,"a":2.0}"#
		);
	}
}
