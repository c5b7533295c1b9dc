//! Generator: converts YAML/JSON Kubernetes manifests into equivalent
//! script source with `install`/`remove` entry points.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context};
use serde_json::Value as Json;

use crate::k8s::scheme::{gvk_from_json, is_registered};

const INDENT: &str = "    ";

struct ManifestEntry {
	json: Json,
	group: String,
	kind: String,
	name: String,
	namespace: String,
	registered: bool,
}

/// Generate script source for the manifests at `path` (a file or a
/// directory of `*.yaml|*.yml|*.json` files) and write it to `out`.
pub fn generate<W: Write>(path: &str, out: &mut W) -> anyhow::Result<()> {
	let content = load_input(Path::new(path))?;
	let entries = parse_documents(&content)?;
	if entries.is_empty() {
		bail!("no Kubernetes objects found in {}", path);
	}

	write!(out, "{}", render(&entries))?;
	Ok(())
}

fn load_input(path: &Path) -> anyhow::Result<String> {
	let meta = std::fs::metadata(path)
		.with_context(|| format!("reading input {}", path.display()))?;
	if !meta.is_dir() {
		return std::fs::read_to_string(path)
			.with_context(|| format!("reading input {}", path.display()));
	}

	let mut files: Vec<_> = std::fs::read_dir(path)?
		.filter_map(Result::ok)
		.map(|e| e.path())
		.filter(|p| {
			matches!(
				p.extension().and_then(|e| e.to_str()),
				Some("yaml") | Some("yml") | Some("json")
			)
		})
		.collect();
	files.sort();

	let mut parts = Vec::with_capacity(files.len());
	for file in files {
		parts.push(
			std::fs::read_to_string(&file)
				.with_context(|| format!("reading input {}", file.display()))?,
		);
	}
	Ok(parts.join("\n---\n"))
}

fn parse_documents(content: &str) -> anyhow::Result<Vec<ManifestEntry>> {
	let mut entries = Vec::new();
	for raw in split_yaml_documents(content) {
		let value: serde_yaml::Value =
			serde_yaml::from_str(&raw).context("parsing manifest document")?;
		if value.is_null() {
			continue;
		}
		let json: Json = serde_json::to_value(value).context("converting manifest to JSON")?;
		let Some(gvk) = gvk_from_json(&json) else {
			bail!("manifest document missing apiVersion or kind");
		};

		let name = json
			.pointer("/metadata/name")
			.and_then(Json::as_str)
			.unwrap_or_default()
			.to_string();
		let namespace = json
			.pointer("/metadata/namespace")
			.and_then(Json::as_str)
			.unwrap_or_default()
			.to_string();

		entries.push(ManifestEntry {
			registered: is_registered(&gvk),
			group: gvk.group,
			kind: gvk.kind,
			name,
			namespace,
			json,
		});
	}
	Ok(entries)
}

fn split_yaml_documents(content: &str) -> Vec<String> {
	let mut docs = Vec::new();
	let mut current = String::new();
	for line in content.lines() {
		if line.trim_end() == "---" {
			if !current.trim().is_empty() {
				docs.push(std::mem::take(&mut current));
			}
			current.clear();
		} else {
			current.push_str(line);
			current.push('\n');
		}
	}
	if !current.trim().is_empty() {
		docs.push(current);
	}
	docs
}

fn render(entries: &[ManifestEntry]) -> String {
	let mut out = String::from("# vim: set syntax=python:\n\n");

	out.push_str("def install(ctx):\n");
	for (i, entry) in entries.iter().enumerate() {
		out.push_str(&render_put(entry));
		if i != entries.len() - 1 {
			out.push('\n');
		}
	}

	let deletes = render_deletes(entries);
	if !deletes.is_empty() {
		out.push_str("\ndef remove(ctx):\n");
		out.push_str(&deletes);
	}

	out
}

fn render_put(entry: &ManifestEntry) -> String {
	let mut out = String::new();
	let data = render_value(&entry.json, 2, entry.registered);

	let call = if entry.registered { "kube.put" } else { "kube.put_yaml" };
	out.push_str(INDENT);
	out.push_str(call);
	out.push_str("(\n");

	out.push_str(&INDENT.repeat(2));
	out.push_str(&format!("name={},\n", quote(&entry.name)));

	if !entry.namespace.is_empty() {
		out.push_str(&INDENT.repeat(2));
		out.push_str(&format!("namespace={},\n", quote(&entry.namespace)));
	}

	if entry.registered && !entry.group.is_empty() {
		out.push_str(&INDENT.repeat(2));
		out.push_str(&format!("api_group={},\n", quote(&entry.group)));
	}

	out.push_str(&INDENT.repeat(2));
	if entry.registered {
		out.push_str(&format!("data=[{}]\n", data));
	} else {
		out.push_str(&format!("data=[{}.to_json()]\n", data));
	}

	out.push_str(INDENT);
	out.push_str(")\n");
	out
}

fn render_deletes(entries: &[ManifestEntry]) -> String {
	let mut out = String::new();
	for entry in entries {
		if entry.kind.is_empty() || entry.name.is_empty() {
			continue;
		}
		let target = if entry.namespace.is_empty() {
			entry.name.clone()
		} else {
			format!("{}/{}", entry.namespace, entry.name)
		};
		out.push_str(INDENT);
		out.push_str(&format!(
			"kube.delete({}={}",
			entry.kind.to_lowercase(),
			quote(&target)
		));
		if !entry.group.is_empty() {
			out.push_str(&format!(", api_group={}", quote(&entry.group)));
		}
		out.push_str(")\n");
	}
	out
}

/// True for values the typed path omits: nulls, zeros, empty strings and
/// containers.
fn is_zero(v: &Json) -> bool {
	match v {
		Json::Null => true,
		Json::Bool(b) => !b,
		Json::Number(n) => n.as_f64() == Some(0.0),
		Json::String(s) => s.is_empty(),
		Json::Array(a) => a.is_empty(),
		Json::Object(m) => m.is_empty(),
	}
}

fn is_identifier(s: &str) -> bool {
	!s.is_empty()
		&& s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
		&& s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote(s: &str) -> String {
	serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

/// Render a JSON value as script source. Maps whose keys are identifiers
/// become `struct(...)` constructors, other maps become dict literals; keys
/// are emitted in sorted order either way.
fn render_value(v: &Json, indent: usize, skip_zero: bool) -> String {
	let pad = INDENT.repeat(indent + 1);
	let close_pad = INDENT.repeat(indent);

	match v {
		Json::Null => "None".to_string(),
		Json::Bool(true) => "True".to_string(),
		Json::Bool(false) => "False".to_string(),
		Json::Number(n) => n.to_string(),
		Json::String(s) => quote(s),
		Json::Array(items) => {
			let rendered: Vec<String> = items
				.iter()
				.map(|i| render_value(i, indent, skip_zero))
				.collect();
			format!("[{}]", rendered.join(", "))
		}
		Json::Object(map) => {
			let mut keys: Vec<&String> = map.keys().collect();
			keys.sort();
			keys.retain(|k| !(skip_zero && is_zero(&map[k.as_str()])));

			if keys.is_empty() {
				return "struct()".to_string();
			}

			let as_struct = keys.iter().all(|k| is_identifier(k));
			let mut out = String::new();
			if as_struct {
				out.push_str("struct(\n");
				for (i, k) in keys.iter().enumerate() {
					out.push_str(&pad);
					out.push_str(&format!(
						"{}={}",
						k,
						render_value(&map[k.as_str()], indent + 1, skip_zero)
					));
					if i != keys.len() - 1 {
						out.push(',');
					}
					out.push('\n');
				}
				out.push_str(&close_pad);
				out.push(')');
			} else {
				out.push_str("{\n");
				for (i, k) in keys.iter().enumerate() {
					out.push_str(&pad);
					out.push_str(&format!(
						"{}: {}",
						quote(k),
						render_value(&map[k.as_str()], indent + 1, skip_zero)
					));
					if i != keys.len() - 1 {
						out.push(',');
					}
					out.push('\n');
				}
				out.push_str(&close_pad);
				out.push('}');
			}
			out
		}
	}
}
