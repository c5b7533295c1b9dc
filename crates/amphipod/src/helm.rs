//! Helm integration: the `helm.apply` builtin and the chart renderer seam.
//!
//! The renderer is an external collaborator with a single `render` method;
//! the default implementation shells out to the `helm` binary. Values lists
//! merge by RFC 7396 JSON-merge-patch in list order, so arrays replace
//! rather than concatenate.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context};
use serde_json::Value as Json;
use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::values::list::ListRef;
use starlark::values::none::NoneType;
use starlark::values::Value;

use crate::bridge::BridgeExtra;
use crate::k8s::scheme::ObjectDocument;
use crate::values::value_to_json;

/// Renders one chart into a list of manifest documents.
pub trait ChartRenderer: Send + Sync {
	fn render(
		&self,
		name: &str,
		namespace: &str,
		chart_path: &Path,
		values: &Json,
	) -> anyhow::Result<Vec<String>>;
}

/// Renderer shelling out to `helm template`.
pub struct HelmCli;

impl ChartRenderer for HelmCli {
	fn render(
		&self,
		name: &str,
		namespace: &str,
		chart_path: &Path,
		values: &Json,
	) -> anyhow::Result<Vec<String>> {
		let values_path = std::env::temp_dir().join(format!("amphipod-values-{}.json", uuid::Uuid::new_v4()));
		std::fs::write(&values_path, serde_json::to_vec(values)?)
			.with_context(|| format!("writing values file {}", values_path.display()))?;

		let mut cmd = Command::new("helm");
		cmd.arg("template").arg(name).arg(chart_path).arg("--values").arg(&values_path);
		if !namespace.is_empty() {
			cmd.arg("--namespace").arg(namespace);
		}

		let output = cmd.output().context("running helm template")?;
		let _ = std::fs::remove_file(&values_path);

		if !output.status.success() {
			bail!(
				"helm template failed: {}",
				String::from_utf8_lossy(&output.stderr)
			);
		}

		Ok(split_documents(&String::from_utf8_lossy(&output.stdout)))
	}
}

/// Split a rendered chart into individual manifest documents, dropping
/// empty and comment-only fragments.
pub fn split_documents(rendered: &str) -> Vec<String> {
	rendered
		.split("\n---")
		.map(str::trim)
		.filter(|doc| {
			doc.lines().any(|l| {
				let l = l.trim();
				!l.is_empty() && l != "---" && !l.starts_with('#')
			})
		})
		.map(str::to_string)
		.collect()
}

/// The helm capability bound to one cluster session.
pub struct HelmFacade {
	renderer: Box<dyn ChartRenderer>,
	base_dir: PathBuf,
}

impl HelmFacade {
	pub fn new(renderer: Box<dyn ChartRenderer>, base_dir: PathBuf) -> Self {
		Self { renderer, base_dir }
	}

	/// Resolve a chart source: `//`-prefixed paths are relative to the
	/// configured base; absolute paths pass through; anything else is a
	/// remote chart reference, which is unsupported.
	fn resolve_chart(&self, chart: &str) -> anyhow::Result<PathBuf> {
		if let Some(rel) = chart.strip_prefix("//") {
			return Ok(self.base_dir.join(rel));
		}
		let path = Path::new(chart);
		if path.is_absolute() {
			return Ok(path.to_path_buf());
		}
		bail!("remote repositories are not supported yet <{}>", chart)
	}

	pub fn render(
		&self,
		name: &str,
		namespace: &str,
		chart: &str,
		values: &Json,
	) -> anyhow::Result<Vec<String>> {
		let chart_path = self.resolve_chart(chart)?;
		self.renderer.render(name, namespace, &chart_path, values)
	}
}

/// Merge a list of value objects in order via RFC 7396 JSON-merge-patch.
/// Arrays replace; later entries win.
pub fn merge_values(values: &[Json]) -> Json {
	let mut merged = Json::Object(Default::default());
	for v in values {
		json_patch::merge(&mut merged, v);
	}
	merged
}

/// Register the `helm` package.
pub fn register(builder: &mut GlobalsBuilder) {
	builder.struct_("helm", helm_module);
}

#[starlark_module]
fn helm_module(builder: &mut GlobalsBuilder) {
	/// Render `chart` with the merged `values` and apply the resulting
	/// manifests. Values merge by JSON-merge-patch in list order.
	fn apply<'v>(
		#[starlark(require = named)] release_name: &str,
		#[starlark(require = named)] chart: &str,
		#[starlark(require = named)] namespace: Option<&str>,
		#[starlark(require = named)] values: Option<Value<'v>>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneType> {
		let extra = BridgeExtra::from_eval(eval)?;
		let helm = extra.helm()?;
		let engine = extra.kube()?;
		let namespace = namespace.unwrap_or_default();

		let mut value_list = Vec::new();
		if let Some(values) = values {
			let list = ListRef::from_value(values)
				.ok_or_else(|| anyhow!("values must be a list (got a `{}')", values.get_type()))?;
			for v in list.iter() {
				value_list.push(value_to_json(v)?);
			}
		}
		let merged = merge_values(&value_list);

		let rendered = helm.render(release_name, namespace, chart, &merged)?;
		let mut docs = Vec::with_capacity(rendered.len());
		for (i, raw) in rendered.iter().enumerate() {
			docs.push(
				ObjectDocument::decode(raw)
					.map_err(|e| anyhow!("rendered manifest {} is invalid: {}", i, e))?,
			);
		}

		extra.block_on(engine.put_yaml(&extra.ctx_json(), "", namespace, docs, &extra.cancel))?;
		Ok(NoneType)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_merge_values_later_wins() {
		let merged = merge_values(&[
			json!({"image": {"tag": "v1"}, "replicas": 2}),
			json!({"image": {"tag": "v2"}}),
		]);
		assert_eq!(merged, json!({"image": {"tag": "v2"}, "replicas": 2}));
	}

	#[test]
	fn test_merge_values_arrays_replace() {
		let merged = merge_values(&[
			json!({"args": ["a", "b"]}),
			json!({"args": ["c"]}),
		]);
		assert_eq!(merged, json!({"args": ["c"]}));
	}

	#[test]
	fn test_merge_values_null_deletes() {
		let merged = merge_values(&[json!({"a": 1, "b": 2}), json!({"b": null})]);
		assert_eq!(merged, json!({"a": 1}));
	}

	#[test]
	fn test_split_documents() {
		let rendered = "---\n# Source: chart/a.yaml\nkind: A\n---\n# comment only\n---\nkind: B\n";
		let docs = split_documents(rendered);
		assert_eq!(docs.len(), 2);
		assert!(docs[0].contains("kind: A"));
		assert!(docs[1].contains("kind: B"));
	}

	#[test]
	fn test_resolve_chart_paths() {
		let facade = HelmFacade::new(Box::new(HelmCli), PathBuf::from("/base"));
		assert_eq!(
			facade.resolve_chart("//charts/web").unwrap(),
			PathBuf::from("/base/charts/web")
		);
		assert_eq!(
			facade.resolve_chart("/abs/chart").unwrap(),
			PathBuf::from("/abs/chart")
		);
		assert!(facade.resolve_chart("repo/chart").is_err());
	}
}
