//! Deterministic YAML rendering and unified diffing of live vs desired
//! objects, with path-based field filtering and empty-map reduction.

use std::io::Write;

use kube::core::GroupVersionKind;
use serde_json::{Map, Value as Json};
use similar::TextDiff;
use thiserror::Error;

use super::kpath::{self, KpathError};
use super::resolve::{maybe_core, maybe_namespaced};

/// Errors produced while rendering or printing diffs.
#[derive(Debug, Error)]
pub enum DiffError {
	#[error("failed to render object as YAML")]
	Yaml(#[source] serde_yaml::Error),

	#[error("invalid diff filter `{filter}'")]
	Filter {
		filter: String,
		#[source]
		source: KpathError,
	},

	#[error("failed to write diff")]
	Io(#[from] std::io::Error),
}

/// Fields the API server always sets; filtered from every rendering.
const BUILTIN_FILTERS: &[&[&str]] = &[
	&["metadata", "selfLink"],
	&["metadata", "uid"],
	&["metadata", "generation"],
	&["metadata", "creationTimestamp"],
	&["status"],
];

/// Render an object to a canonical YAML string suitable for line diffing.
///
/// Secrets are redacted, server-populated noise fields and user-supplied
/// k-path filters are pruned, and empty maps are reduced away.
pub fn render_obj(
	obj: &Json,
	gvk: &GroupVersionKind,
	filters: &[String],
) -> Result<String, DiffError> {
	let mut doc = obj.clone();

	if gvk.group.is_empty() && gvk.kind == "Secret" {
		redact_secret(&mut doc);
	}

	// Recover kind/apiVersion from the resolved identity when the object
	// itself doesn't carry them.
	let has_kind = doc.get("kind").and_then(Json::as_str).is_some_and(|k| !k.is_empty());
	if !has_kind {
		if let Json::Object(obj) = &mut doc {
			let mut with_meta = Map::new();
			with_meta.insert("kind".into(), Json::String(gvk.kind.clone()));
			with_meta.insert("apiVersion".into(), Json::String(gvk.api_version()));
			with_meta.append(obj);
			*obj = with_meta;
		}
	}

	for path in BUILTIN_FILTERS {
		prune_path(&mut doc, path);
	}

	for filter in filters {
		let parts = kpath::split(filter).map_err(|source| DiffError::Filter {
			filter: filter.clone(),
			source,
		})?;
		let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
		prune_path(&mut doc, &parts);
	}

	reduce_empty(&mut doc);

	serde_yaml::to_string(&doc).map_err(DiffError::Yaml)
}

/// Replace secret payloads so they never reach logs or terminals: byte data
/// becomes null, string data becomes the literal `<redacted>`.
fn redact_secret(doc: &mut Json) {
	if let Some(Json::Object(data)) = doc.get_mut("data") {
		for v in data.values_mut() {
			*v = Json::Null;
		}
	}
	if let Some(Json::Object(data)) = doc.get_mut("stringData") {
		for v in data.values_mut() {
			*v = Json::String("<redacted>".to_string());
		}
	}
}

/// Remove the leaf addressed by `path`. Maps are indexed by key, arrays by
/// decimal index; missing segments are a no-op.
fn prune_path(doc: &mut Json, path: &[&str]) {
	let Some((leaf, parents)) = path.split_last() else {
		return;
	};

	let mut cur = doc;
	for seg in parents {
		cur = match cur {
			Json::Object(map) => match map.get_mut(*seg) {
				Some(v) => v,
				None => return,
			},
			Json::Array(arr) => match seg.parse::<usize>().ok().and_then(|i| arr.get_mut(i)) {
				Some(v) => v,
				None => return,
			},
			_ => return,
		};
	}

	match cur {
		Json::Object(map) => {
			map.shift_remove(*leaf);
		}
		Json::Array(arr) => {
			if let Ok(i) = leaf.parse::<usize>() {
				if i < arr.len() {
					arr.remove(i);
				}
			}
		}
		_ => {}
	}
}

/// Recursively drop map entries whose value is an empty map.
fn reduce_empty(doc: &mut Json) {
	match doc {
		Json::Object(map) => {
			for v in map.values_mut() {
				reduce_empty(v);
			}
			map.retain(|_, v| !matches!(v, Json::Object(m) if m.is_empty()));
		}
		Json::Array(arr) => {
			for v in arr.iter_mut() {
				reduce_empty(v);
			}
		}
		_ => {}
	}
}

/// Apply the conditional mutations that hide controller-assigned differences
/// from diff output. Operates on deep copies only; never feeds writes.
pub fn suppress_spurious(live: &mut Json, desired: &mut Json, gvk: &GroupVersionKind) {
	if !gvk.group.is_empty() {
		return;
	}

	match gvk.kind.as_str() {
		"Service" => {
			// A nodePort the controller assigned shows up only on live; zero
			// it there when the desired port (matched by name) leaves it
			// unset.
			let desired_unset: Vec<String> = port_names_with_unset_node_port(desired);
			if let Some(Json::Array(ports)) = live.pointer_mut("/spec/ports") {
				for port in ports.iter_mut() {
					let name = port.get("name").and_then(Json::as_str).unwrap_or_default();
					if desired_unset.iter().any(|n| n == name) {
						if let Some(obj) = port.as_object_mut() {
							obj.shift_remove("nodePort");
						}
					}
				}
			}
		}
		"Namespace" => {
			for side in [&mut *live, &mut *desired] {
				if let Some(Json::Array(finalizers)) = side.pointer_mut("/spec/finalizers") {
					finalizers.retain(|f| f.as_str() != Some("kubernetes"));
				}
			}
		}
		"ServiceAccount" => {
			let sa_name = desired
				.pointer("/metadata/name")
				.and_then(Json::as_str)
				.map(|s| format!("{}-token", s));
			if let (Some(token_prefix), Some(Json::Array(secrets))) =
				(sa_name, live.pointer_mut("/secrets"))
			{
				secrets.retain(|s| {
					!s.get("name")
						.and_then(Json::as_str)
						.is_some_and(|n| n.contains(&token_prefix))
				});
			}
		}
		_ => {}
	}
}

fn port_names_with_unset_node_port(svc: &Json) -> Vec<String> {
	let Some(Json::Array(ports)) = svc.pointer("/spec/ports") else {
		return Vec::new();
	};
	ports
		.iter()
		.filter(|p| p.get("nodePort").and_then(Json::as_i64).unwrap_or(0) == 0)
		.filter_map(|p| p.get("name").and_then(Json::as_str))
		.map(str::to_string)
		.collect()
}

/// Print the unified diff of live against head. If live is `None` (create
/// path) only the right side is rendered. An empty diff prints the header
/// line alone.
pub fn print_unified_diff<W: Write>(
	w: &mut W,
	live: Option<&Json>,
	head: &Json,
	gvk: &GroupVersionKind,
	name: &str,
	filters: &[String],
) -> Result<(), DiffError> {
	let full_name = format!("{}{} `{}'", gvk.kind.to_lowercase(), maybe_core(&gvk.group), name);

	let (left, right) = match live {
		Some(live) => {
			let mut live = live.clone();
			let mut head = head.clone();
			suppress_spurious(&mut live, &mut head, gvk);
			(render_obj(&live, gvk, filters)?, render_obj(&head, gvk, filters)?)
		}
		None => (String::new(), render_obj(head, gvk, filters)?),
	};

	writeln!(w, "\n*** {} ***", full_name)?;

	if left == right {
		return Ok(());
	}

	let diff = TextDiff::from_lines(&left, &right);
	write!(
		w,
		"{}",
		diff.unified_diff().context_radius(5).header("live", "head")
	)?;
	Ok(())
}

/// Convenience wrapper returning the diff as a string.
pub fn unified_diff_string(
	live: Option<&Json>,
	head: &Json,
	gvk: &GroupVersionKind,
	name: &str,
	namespace: &str,
	filters: &[String],
) -> Result<String, DiffError> {
	let mut out = Vec::new();
	print_unified_diff(
		&mut out,
		live,
		head,
		gvk,
		&maybe_namespaced(name, namespace),
		filters,
	)?;
	Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn pod_gvk() -> GroupVersionKind {
		GroupVersionKind::gvk("", "v1", "Pod")
	}

	#[test]
	fn test_builtin_filters_pruned() {
		let obj = json!({
			"kind": "Pod",
			"apiVersion": "v1",
			"metadata": {
				"name": "p",
				"uid": "1234",
				"selfLink": "/x",
				"generation": 3,
				"creationTimestamp": "2020-01-01T00:00:00Z"
			},
			"status": {"phase": "Running"}
		});
		let out = render_obj(&obj, &pod_gvk(), &[]).unwrap();
		assert!(!out.contains("uid"));
		assert!(!out.contains("selfLink"));
		assert!(!out.contains("generation"));
		assert!(!out.contains("creationTimestamp"));
		assert!(!out.contains("status"));
		assert!(out.contains("name: p"));
	}

	#[test]
	fn test_user_filter_quoted_key() {
		let obj = json!({
			"kind": "Pod",
			"apiVersion": "v1",
			"metadata": {
				"name": "p",
				"annotations": {"x/y": "1", "keep": "2"}
			}
		});
		let filters = vec![r#"metadata.annotations["x/y"]"#.to_string()];
		let out = render_obj(&obj, &pod_gvk(), &filters).unwrap();
		assert!(!out.contains("x/y"));
		assert!(out.contains("keep"));
	}

	#[test]
	fn test_kind_recovered_from_gvk() {
		let obj = json!({"metadata": {"name": "p"}});
		let out = render_obj(&obj, &pod_gvk(), &[]).unwrap();
		let mut lines = out.lines();
		assert_eq!(lines.next(), Some("kind: Pod"));
		assert_eq!(lines.next(), Some("apiVersion: v1"));
	}

	#[test]
	fn test_empty_maps_reduced() {
		let obj = json!({
			"kind": "Pod",
			"apiVersion": "v1",
			"metadata": {"name": "p", "labels": {}},
			"spec": {"nodeSelector": {"deep": {}}}
		});
		let out = render_obj(&obj, &pod_gvk(), &[]).unwrap();
		assert!(!out.contains("labels"));
		assert!(!out.contains("spec"));
	}

	#[test]
	fn test_secret_redaction() {
		let obj = json!({
			"kind": "Secret",
			"apiVersion": "v1",
			"metadata": {"name": "s"},
			"data": {"password": "aHVudGVyMg=="},
			"stringData": {"token": "hunter2"}
		});
		let gvk = GroupVersionKind::gvk("", "v1", "Secret");
		let out = render_obj(&obj, &gvk, &[]).unwrap();
		assert!(!out.contains("aHVudGVyMg=="));
		assert!(!out.contains("hunter2"));
		assert!(out.contains("<redacted>"));
	}

	#[test]
	fn test_node_port_suppression() {
		let gvk = GroupVersionKind::gvk("", "v1", "Service");
		let mut live = json!({
			"kind": "Service",
			"apiVersion": "v1",
			"metadata": {"name": "s"},
			"spec": {"ports": [{"name": "http", "port": 80, "nodePort": 31000}]}
		});
		let mut head = json!({
			"kind": "Service",
			"apiVersion": "v1",
			"metadata": {"name": "s"},
			"spec": {"ports": [{"name": "http", "port": 80}]}
		});
		suppress_spurious(&mut live, &mut head, &gvk);
		assert!(live.pointer("/spec/ports/0/nodePort").is_none());

		let out = unified_diff_string(Some(&live), &head, &gvk, "s", "", &[]).unwrap();
		assert_eq!(out.lines().count(), 2, "expected header only, got: {out}");
	}

	#[test]
	fn test_namespace_finalizer_suppression() {
		let gvk = GroupVersionKind::gvk("", "v1", "Namespace");
		let mut live = json!({"spec": {"finalizers": ["kubernetes"]}});
		let mut head = json!({"spec": {"finalizers": []}});
		suppress_spurious(&mut live, &mut head, &gvk);
		assert_eq!(live.pointer("/spec/finalizers").unwrap(), &json!([]));
	}

	#[test]
	fn test_service_account_token_suppression() {
		let gvk = GroupVersionKind::gvk("", "v1", "ServiceAccount");
		let mut live = json!({
			"metadata": {"name": "sa"},
			"secrets": [{"name": "sa-token-abcde"}, {"name": "keep"}]
		});
		let mut head = json!({"metadata": {"name": "sa"}});
		suppress_spurious(&mut live, &mut head, &gvk);
		assert_eq!(
			live.pointer("/secrets").unwrap(),
			&json!([{"name": "keep"}])
		);
	}

	#[test]
	fn test_filtered_update_diff() {
		// Live carries a context annotation and server-assigned uid; desired
		// has neither. With the annotation filtered the diff collapses to
		// the header, without it only the annotation shows up.
		let live = json!({
			"kind": "Pod",
			"apiVersion": "v1",
			"metadata": {
				"name": "p",
				"namespace": "ns",
				"uid": "abc-123",
				"annotations": {"system/context": "old"}
			}
		});
		let head = json!({
			"kind": "Pod",
			"apiVersion": "v1",
			"metadata": {"name": "p", "namespace": "ns"}
		});

		let filters = vec![r#"metadata.annotations["system/context"]"#.to_string()];
		let out = unified_diff_string(Some(&live), &head, &pod_gvk(), "p", "ns", &filters).unwrap();
		assert_eq!(out.lines().count(), 2, "expected header only, got: {out}");

		let out = unified_diff_string(Some(&live), &head, &pod_gvk(), "p", "ns", &[]).unwrap();
		assert!(out.contains("-") && out.contains("system/context"), "{out}");
		assert!(!out.contains("abc-123"), "uid is always filtered: {out}");
	}

	#[test]
	fn test_create_path_diff_is_right_side_only() {
		let head = json!({
			"kind": "Pod",
			"apiVersion": "v1",
			"metadata": {"name": "p", "namespace": "ns"}
		});
		let out = unified_diff_string(None, &head, &pod_gvk(), "p", "ns", &[]).unwrap();
		assert!(out.starts_with("\n*** pod.v1 `ns/p' ***\n"));
		assert!(out.contains("--- live"));
		assert!(out.contains("+++ head"));
		assert!(out.contains("+kind: Pod"));
		assert!(!out.contains("-kind"));
	}
}
