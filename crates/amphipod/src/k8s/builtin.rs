//! The `kube` builtin package: the script-facing surface of the apply
//! engine.

use std::time::Duration;

use anyhow::{anyhow, bail};
use regex::Regex;
use starlark::collections::SmallMap;
use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::values::list::ListRef;
use starlark::values::none::NoneType;
use starlark::values::Value;
use std::sync::OnceLock;

use super::engine::EngineError;
use super::resolve::maybe_core;
use super::scheme::{self, ObjectDocument};
use crate::bridge::BridgeExtra;
use crate::values::{json_to_value, value_to_json};

/// Resource key addressing a Namespace object itself; its value never
/// carries a containing namespace.
const NAMESPACE_RESOURCE: &str = "namespace";

/// Register the `kube` package.
pub fn register(builder: &mut GlobalsBuilder) {
	builder.struct_("kube", kube_module);
}

#[starlark_module]
fn kube_module(builder: &mut GlobalsBuilder) {
	/// Apply each typed item in `data`, enforcing the metadata policy and
	/// reconciling against live state.
	fn put<'v>(
		#[starlark(require = named)] name: &str,
		#[starlark(require = named)] data: Value<'v>,
		#[starlark(require = named)] namespace: Option<&str>,
		#[starlark(require = named)] api_group: Option<&str>,
		#[starlark(require = named)] subresource: Option<&str>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneType> {
		let extra = BridgeExtra::from_eval(eval)?;
		let engine = extra.kube()?;

		let items = ListRef::from_value(data)
			.ok_or_else(|| anyhow!("data must be a list (got a `{}')", data.get_type()))?;
		let mut docs = Vec::with_capacity(items.len());
		for (i, item) in items.iter().enumerate() {
			let json = value_to_json(item)
				.map_err(|e| anyhow!("item {} is not a Kubernetes object: {}", i, e))?;
			docs.push(
				ObjectDocument::from_json(json)
					.map_err(|e| anyhow!("item {} is not a Kubernetes object: {}", i, e))?,
			);
		}

		extra.block_on(engine.put(
			&extra.ctx_json(),
			name,
			namespace.unwrap_or_default(),
			api_group.unwrap_or_default(),
			subresource.unwrap_or_default(),
			docs,
			&extra.cancel,
		))?;
		Ok(NoneType)
	}

	/// Apply each YAML/JSON document in `data` through the dynamic path.
	fn put_yaml<'v>(
		#[starlark(require = named)] name: &str,
		#[starlark(require = named)] data: Value<'v>,
		#[starlark(require = named)] namespace: Option<&str>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneType> {
		let extra = BridgeExtra::from_eval(eval)?;
		let engine = extra.kube()?;

		let items = ListRef::from_value(data)
			.ok_or_else(|| anyhow!("data must be a list (got a `{}')", data.get_type()))?;
		let mut docs = Vec::with_capacity(items.len());
		for (i, item) in items.iter().enumerate() {
			let raw = item
				.unpack_str()
				.ok_or_else(|| anyhow!("item {} is not a YAML string (got: {})", i, item.get_type()))?;
			docs.push(
				ObjectDocument::decode(raw)
					.map_err(|e| anyhow!("item {} is not a YAML document: {}", i, e))?,
			);
		}

		extra.block_on(engine.put_yaml(
			&extra.ctx_json(),
			name,
			namespace.unwrap_or_default(),
			docs,
			&extra.cancel,
		))?;
		Ok(NoneType)
	}

	/// Delete `<resource>=<"[ns/]name">`; propagation is background unless
	/// `foreground=True`.
	fn delete<'v>(
		#[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneType> {
		let extra = BridgeExtra::from_eval(eval)?;
		let engine = extra.kube()?;
		let args = ResourceArgs::parse(&kwargs, &["api_group", "foreground"])?;

		extra.block_on(async {
			let r = engine
				.resolve_resource(&args.name, &args.namespace, &args.api_group, &args.resource)
				.await?;
			engine.delete(&r, args.foreground, &extra.cancel).await
		})?;
		Ok(NoneType)
	}

	/// Read one object; with `wait` retries every second until found or the
	/// timer fires. `json=True` returns the unstructured mapping.
	fn get<'v>(
		#[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<Value<'v>> {
		let extra = BridgeExtra::from_eval(eval)?;
		let engine = extra.kube()?;
		let args = ResourceArgs::parse(&kwargs, &["api_group", "wait", "json"])?;

		let (obj, registered) = extra
			.block_on(async {
				let r = engine
					.resolve_resource(&args.name, &args.namespace, &args.api_group, &args.resource)
					.await?;
				let registered = scheme::is_registered(&r.gvk);
				let obj = engine.get(&r, args.wait, &extra.cancel).await?;
				Ok::<_, EngineError>((obj, registered))
			})
			.map_err(|e| {
				anyhow!(
					"failed to get {}{} `{}': {}",
					args.resource,
					maybe_core(&args.api_group),
					args.name,
					e
				)
			})?;

		if !args.json && !registered {
			bail!(
				"could not convert {} `{}' to a typed object; pass json=True",
				args.resource,
				args.name
			);
		}

		Ok(json_to_value(eval.heap(), &obj))
	}

	/// Boolean variant of `get`: NotFound reads as False.
	fn exists<'v>(
		#[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<bool> {
		let extra = BridgeExtra::from_eval(eval)?;
		let engine = extra.kube()?;
		let args = ResourceArgs::parse(&kwargs, &["api_group", "wait"])?;

		let res = extra.block_on(async {
			let r = engine
				.resolve_resource(&args.name, &args.namespace, &args.api_group, &args.resource)
				.await?;
			engine.get(&r, args.wait, &extra.cancel).await
		});

		match res {
			Ok(_) => Ok(true),
			Err(EngineError::NotFound) => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// Validate and canonicalize a Kubernetes quantity string.
	fn resource_quantity(s: &str) -> anyhow::Result<String> {
		if !quantity_re().is_match(s) {
			bail!("failed to parse quantity string `{}'", s);
		}
		Ok(s.to_string())
	}

	/// Int-or-string wrapper, string form.
	fn from_str(s: &str) -> anyhow::Result<String> {
		Ok(s.to_string())
	}

	/// Int-or-string wrapper, integer form.
	fn from_int(i: i32) -> anyhow::Result<i32> {
		Ok(i)
	}
}

fn quantity_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		Regex::new(r"^[+-]?(\d+|\d+\.\d*|\.\d+)(([KMGTPE]i)|[numkMGTPE]|([eE][+-]?\d+))?$")
			.expect("static regex")
	})
}

/// Parsed `<resource>=<value>` argument family shared by delete/get/exists.
#[derive(Debug)]
struct ResourceArgs {
	resource: String,
	name: String,
	namespace: String,
	api_group: String,
	foreground: bool,
	wait: Option<Duration>,
	json: bool,
}

impl ResourceArgs {
	/// Exactly one kwarg outside `options` names the resource and carries
	/// `"<namespace>/<name>"` (or `"<name>"` for cluster-scoped kinds).
	fn parse(kwargs: &SmallMap<String, Value>, options: &[&str]) -> anyhow::Result<Self> {
		let mut args = Self {
			resource: String::new(),
			name: String::new(),
			namespace: String::new(),
			api_group: String::new(),
			foreground: false,
			wait: None,
			json: false,
		};

		for (key, v) in kwargs.iter() {
			let (key, v) = (key.as_str(), *v);
			match key {
				"api_group" if options.contains(&"api_group") => {
					args.api_group = unpack_str_arg(key, v)?.to_string();
				}
				"foreground" if options.contains(&"foreground") => {
					args.foreground = v
						.unpack_bool()
						.ok_or_else(|| anyhow!("expected bool value for `foreground' arg, got: {}", v.get_type()))?;
				}
				"wait" if options.contains(&"wait") => {
					let dur = unpack_str_arg(key, v)?;
					args.wait = Some(
						humantime::parse_duration(dur)
							.map_err(|e| anyhow!("failed to parse duration value: {}", e))?,
					);
				}
				"json" if options.contains(&"json") => {
					args.json = v
						.unpack_bool()
						.ok_or_else(|| anyhow!("expected bool value for `json' arg, got: {}", v.get_type()))?;
				}
				other => {
					if !args.resource.is_empty() {
						bail!(
							"expected exactly one <resource>=<name> pair, got both `{}' and `{}'",
							args.resource,
							other
						);
					}
					args.resource = other.to_string();
					args.name = unpack_str_arg(other, v)?.to_string();
				}
			}
		}

		if args.resource.is_empty() {
			bail!("expected <resource>=<name>");
		}

		// The namespace resource key is reserved: its value is never split.
		if args.resource != NAMESPACE_RESOURCE {
			if let Some((ns, name)) = args.name.split_once('/') {
				args.namespace = ns.to_string();
				args.name = name.to_string();
			}
		}

		Ok(args)
	}
}

fn unpack_str_arg<'v>(key: &str, v: Value<'v>) -> anyhow::Result<&'v str> {
	v.unpack_str()
		.ok_or_else(|| anyhow!("expected string value for `{}' arg, got: {}", key, v.get_type()))
}
