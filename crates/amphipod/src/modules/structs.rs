//! The `struct()` value object: immutable keyword fields with a
//! deterministic `.to_json()` rendering.

use std::collections::BTreeMap;
use std::fmt;

use allocative::Allocative;
use serde_json::Value as Json;
use starlark::any::ProvidesStaticType;
use starlark::collections::SmallMap;
use starlark::environment::{GlobalsBuilder, Methods, MethodsBuilder, MethodsStatic};
use starlark::starlark_module;
use starlark::starlark_simple_value;
use starlark::values::{starlark_value, Heap, NoSerialize, StarlarkValue, Value, ValueLike};

use crate::values::{json_to_value, value_to_json};

/// Immutable value object constructed by `struct(**kwargs)`.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct StructValue {
	#[allocative(skip)]
	fields: BTreeMap<String, Json>,
}

starlark_simple_value!(StructValue);

impl StructValue {
	pub fn from_fields(fields: BTreeMap<String, Json>) -> Self {
		Self { fields }
	}

	/// Render the fields as a JSON object. Keys are emitted in sorted order
	/// at every nesting level.
	pub fn to_json(&self) -> Json {
		let mut obj = serde_json::Map::new();
		for (k, v) in &self.fields {
			obj.insert(k.clone(), sort_keys(v.clone()));
		}
		Json::Object(obj)
	}
}

/// Recursively order object keys for reproducible serialization.
fn sort_keys(j: Json) -> Json {
	match j {
		Json::Object(map) => {
			let sorted: BTreeMap<String, Json> = map.into_iter().collect();
			let mut out = serde_json::Map::new();
			for (k, v) in sorted {
				out.insert(k, sort_keys(v));
			}
			Json::Object(out)
		}
		Json::Array(items) => Json::Array(items.into_iter().map(sort_keys).collect()),
		other => other,
	}
}

impl fmt::Display for StructValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "struct(")?;
		for (i, (k, v)) in self.fields.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{} = {}", k, v)?;
		}
		write!(f, ")")
	}
}

#[starlark_value(type = "struct")]
impl<'v> StarlarkValue<'v> for StructValue {
	fn get_attr(&self, attribute: &str, heap: &'v Heap) -> Option<Value<'v>> {
		self.fields.get(attribute).map(|v| json_to_value(heap, v))
	}

	fn dir_attr(&self) -> Vec<String> {
		self.fields.keys().cloned().collect()
	}

	fn get_methods() -> Option<&'static Methods> {
		static RES: MethodsStatic = MethodsStatic::new();
		RES.methods(struct_methods)
	}
}

#[starlark_module]
fn struct_methods(builder: &mut MethodsBuilder) {
	/// Serialize the struct deterministically: keys in sorted order.
	fn to_json<'v>(this: Value<'v>) -> anyhow::Result<String> {
		let this = this
			.downcast_ref::<StructValue>()
			.ok_or_else(|| anyhow::anyhow!("to_json called on a non-struct value"))?;
		Ok(serde_json::to_string(&this.to_json())?)
	}
}

/// Register the `struct` constructor.
pub fn register(builder: &mut GlobalsBuilder) {
	struct_constructor(builder);
}

#[starlark_module]
fn struct_constructor(builder: &mut GlobalsBuilder) {
	fn r#struct<'v>(
		#[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
	) -> anyhow::Result<StructValue> {
		let mut fields = BTreeMap::new();
		for (key, v) in kwargs.iter() {
			fields.insert(key.clone(), value_to_json(*v)?);
		}
		Ok(StructValue::from_fields(fields))
	}
}
