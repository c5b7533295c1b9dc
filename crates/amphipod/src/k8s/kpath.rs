//! K-path parsing: dot- and bracket-delimited paths into nested structures.
//!
//! Parts are delimited either by a period (`a.b`) or by brackets and quotes
//! (`a["b.c"]`). Array elements are indexed with bare brackets (`a[0]`). All
//! delimiters combine: `a.b["k"].c[0]`.

use thiserror::Error;

/// Errors produced while parsing a k-path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KpathError {
	#[error("empty path")]
	Empty,

	#[error("unclosed map index in path")]
	UnclosedMapIndex,

	#[error("unclosed array index in path")]
	UnclosedArrayIndex,
}

struct Part<'a> {
	part: &'a str,
	rest: &'a str,
	more: bool,
}

/// Split a k-path string into its parts.
pub fn split(path: &str) -> Result<Vec<String>, KpathError> {
	let mut parts = Vec::new();
	let mut path = path;
	loop {
		let r = parse(path)?;
		parts.push(r.part.to_string());
		path = r.rest;
		if !r.more {
			break;
		}
	}
	Ok(parts)
}

/// Extract the first part of a k-path, returning the part, the remaining
/// path, and whether more parts are expected. If `more` is true and the rest
/// is empty, the next `parse` call errors (trailing delimiter).
fn parse(path: &str) -> Result<Part<'_>, KpathError> {
	if path.is_empty() {
		return Err(KpathError::Empty);
	}

	let bytes = path.as_bytes();
	if bytes[0] == b'[' {
		if path.len() < 2 {
			return Err(KpathError::UnclosedArrayIndex);
		}

		let (part, end) = if bytes[1] == b'"' {
			// Explicit string map index.
			let i = path.find("\"]").ok_or(KpathError::UnclosedMapIndex)?;
			(&path[2..i], i + 2)
		} else {
			// Array index.
			let i = path.find(']').ok_or(KpathError::UnclosedArrayIndex)?;
			(&path[1..i], i + 1)
		};

		let (rest, more) = if path.len() > end {
			if bytes[end] == b'.' {
				(&path[end + 1..], true)
			} else {
				(&path[end..], true)
			}
		} else {
			("", false)
		};
		return Ok(Part { part, rest, more });
	}

	// Implicit string map index.
	for (i, b) in bytes.iter().enumerate() {
		match b {
			b'.' => {
				return Ok(Part {
					part: &path[..i],
					rest: &path[i + 1..],
					more: true,
				})
			}
			b'[' => {
				return Ok(Part {
					part: &path[..i],
					rest: &path[i..],
					more: true,
				})
			}
			_ => {}
		}
	}

	Ok(Part {
		part: path,
		rest: "",
		more: false,
	})
}
