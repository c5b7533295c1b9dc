//! Small shared helpers: diff-filter files and command-line context pairs.

use std::path::Path;

use anyhow::{bail, Context};
use indexmap::IndexMap;

/// Load a newline-delimited filter file. Blank lines and `#` comments are
/// ignored.
pub fn load_filter_file(path: &Path) -> anyhow::Result<Vec<String>> {
	let content = std::fs::read_to_string(path)
		.with_context(|| format!("reading filter file {}", path.display()))?;
	Ok(content
		.lines()
		.map(str::trim)
		.filter(|l| !l.is_empty() && !l.starts_with('#'))
		.map(str::to_string)
		.collect())
}

/// Parse a `foo=bar,baz=qux` parameter list, preserving order.
pub fn parse_context_params(raw: &str) -> anyhow::Result<IndexMap<String, String>> {
	let mut out = IndexMap::new();
	if raw.trim().is_empty() {
		return Ok(out);
	}
	for pair in raw.split(',') {
		let Some((k, v)) = pair.split_once('=') else {
			bail!("invalid context parameter `{}': expected key=value", pair);
		};
		out.insert(k.trim().to_string(), v.trim().to_string());
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_context_params() {
		let params = parse_context_params("env=prod, region=us-west1").unwrap();
		assert_eq!(params.get("env").map(String::as_str), Some("prod"));
		assert_eq!(params.get("region").map(String::as_str), Some("us-west1"));
	}

	#[test]
	fn test_parse_context_params_empty() {
		assert!(parse_context_params("").unwrap().is_empty());
		assert!(parse_context_params("  ").unwrap().is_empty());
	}

	#[test]
	fn test_parse_context_params_rejects_bare_key() {
		assert!(parse_context_params("novalue").is_err());
	}

	#[test]
	fn test_load_filter_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("filters");
		std::fs::write(
			&path,
			"# server-assigned\nmetadata.uid\n\n  status  \n# done\n",
		)
		.unwrap();
		let filters = load_filter_file(&path).unwrap();
		assert_eq!(filters, vec!["metadata.uid", "status"]);
	}
}
