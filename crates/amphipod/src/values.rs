//! Conversions between script values and JSON trees.
//!
//! JSON-like values map 1:1: objects become dicts, arrays become lists, and
//! numbers cross native→script as floats. Script→native conversion folds
//! integral floats back into JSON integers so manifests round-trip cleanly.

use anyhow::{anyhow, bail};
use serde_json::{Map, Number, Value as Json};
use starlark::values::dict::{AllocDict, DictRef};
use starlark::values::float::StarlarkFloat;
use starlark::values::list::{AllocList, ListRef};
use starlark::values::tuple::TupleRef;
use starlark::values::{Heap, Value, ValueLike};

use crate::context::SkyCtx;
use crate::modules::structs::StructValue;

/// Convert a script value into a JSON tree.
pub fn value_to_json(v: Value) -> anyhow::Result<Json> {
	if v.is_none() {
		return Ok(Json::Null);
	}
	if let Some(b) = v.unpack_bool() {
		return Ok(Json::Bool(b));
	}
	if let Some(i) = v.unpack_i32() {
		return Ok(Json::from(i64::from(i)));
	}
	if let Some(f) = v.downcast_ref::<StarlarkFloat>() {
		return Ok(float_to_json(f.0));
	}
	if let Some(s) = v.unpack_str() {
		return Ok(Json::String(s.to_string()));
	}
	if let Some(list) = ListRef::from_value(v) {
		return list.iter().map(value_to_json).collect::<Result<Vec<_>, _>>().map(Json::Array);
	}
	if let Some(tuple) = TupleRef::from_value(v) {
		return tuple.iter().map(value_to_json).collect::<Result<Vec<_>, _>>().map(Json::Array);
	}
	if let Some(dict) = DictRef::from_value(v) {
		let mut out = Map::new();
		for (k, item) in dict.iter() {
			let key = k
				.unpack_str()
				.ok_or_else(|| anyhow!("{} key is not a string (got a `{}')", k, k.get_type()))?;
			out.insert(key.to_string(), value_to_json(item)?);
		}
		return Ok(Json::Object(out));
	}
	if let Some(ctx) = v.downcast_ref::<SkyCtx>() {
		return Ok(ctx.to_json());
	}
	if let Some(s) = v.downcast_ref::<StructValue>() {
		return Ok(s.to_json());
	}

	bail!("cannot convert `{}' value to JSON", v.get_type())
}

/// Rebuild a script value from a JSON tree on the given heap.
pub fn json_to_value<'v>(heap: &'v Heap, j: &Json) -> Value<'v> {
	match j {
		Json::Null => Value::new_none(),
		Json::Bool(b) => Value::new_bool(*b),
		Json::Number(n) => heap.alloc(n.as_f64().unwrap_or(0.0)),
		Json::String(s) => heap.alloc(s.as_str()),
		Json::Array(items) => {
			let values: Vec<Value> = items.iter().map(|i| json_to_value(heap, i)).collect();
			heap.alloc(AllocList(values))
		}
		Json::Object(map) => {
			let pairs: Vec<(&str, Value)> = map
				.iter()
				.map(|(k, v)| (k.as_str(), json_to_value(heap, v)))
				.collect();
			heap.alloc(AllocDict(pairs))
		}
	}
}

fn float_to_json(f: f64) -> Json {
	if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) {
		Json::from(f as i64)
	} else {
		Number::from_f64(f).map(Json::Number).unwrap_or(Json::Null)
	}
}
