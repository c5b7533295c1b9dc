//! Generic HTTP builtin: `http.{get,post,put,patch,delete}`.
//!
//! Headers are supplied as a dict of string → string-or-list-of-strings.
//! Non-2xx responses error out; an empty body reads as None. Redirects are
//! followed up to the client default of ten hops.

use anyhow::anyhow;
use reqwest::Method;
use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::values::dict::DictRef;
use starlark::values::list::ListRef;
use starlark::values::none::NoneOr;
use starlark::values::Value;

use crate::bridge::BridgeExtra;

/// Register the `http` package.
pub fn register(builder: &mut GlobalsBuilder) {
	builder.struct_("http", http_module);
}

#[starlark_module]
fn http_module(builder: &mut GlobalsBuilder) {
	fn get<'v>(
		url: &str,
		#[starlark(require = named)] headers: Option<Value<'v>>,
		#[starlark(require = named)] data: Option<&str>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneOr<String>> {
		do_request(Method::GET, url, headers, data, eval)
	}

	fn post<'v>(
		url: &str,
		#[starlark(require = named)] headers: Option<Value<'v>>,
		#[starlark(require = named)] data: Option<&str>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneOr<String>> {
		do_request(Method::POST, url, headers, data, eval)
	}

	fn put<'v>(
		url: &str,
		#[starlark(require = named)] headers: Option<Value<'v>>,
		#[starlark(require = named)] data: Option<&str>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneOr<String>> {
		do_request(Method::PUT, url, headers, data, eval)
	}

	fn patch<'v>(
		url: &str,
		#[starlark(require = named)] headers: Option<Value<'v>>,
		#[starlark(require = named)] data: Option<&str>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneOr<String>> {
		do_request(Method::PATCH, url, headers, data, eval)
	}

	fn delete<'v>(
		url: &str,
		#[starlark(require = named)] headers: Option<Value<'v>>,
		#[starlark(require = named)] data: Option<&str>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneOr<String>> {
		do_request(Method::DELETE, url, headers, data, eval)
	}
}

fn do_request<'v>(
	method: Method,
	url: &str,
	headers: Option<Value<'v>>,
	data: Option<&str>,
	eval: &mut Evaluator<'v, '_>,
) -> anyhow::Result<NoneOr<String>> {
	let extra = BridgeExtra::from_eval(eval)?;
	let client = extra.http()?.clone();

	let mut req = client.request(method.clone(), url);
	if let Some(headers) = headers {
		for (key, values) in flatten_headers(headers)? {
			for v in values {
				req = req.header(&key, v);
			}
		}
	}
	if let Some(body) = data {
		req = req.body(body.to_string());
	}

	let cancel = extra.cancel.clone();
	let resp = extra.block_on(async {
		tokio::select! {
			_ = cancel.cancelled() => Err(anyhow!("operation cancelled")),
			res = req.send() => res.map_err(|e| anyhow!("request failed: {}", e)),
		}
	})?;

	let status = resp.status();
	let body = extra.block_on(resp.text())?;
	if !status.is_success() {
		return Err(anyhow!("{} {} returned {}: {}", method, url, status.as_u16(), body));
	}

	if body.is_empty() {
		Ok(NoneOr::None)
	} else {
		Ok(NoneOr::Other(body))
	}
}

/// Expand a headers dict into (name, values) pairs. Values are strings for
/// single-value headers or lists for repeated ones.
fn flatten_headers(headers: Value) -> anyhow::Result<Vec<(String, Vec<String>)>> {
	let dict = DictRef::from_value(headers)
		.ok_or_else(|| anyhow!("headers must be a dict (got a `{}')", headers.get_type()))?;

	let mut out = Vec::new();
	for (k, v) in dict.iter() {
		let key = k.unpack_str().ok_or_else(|| anyhow!("header name must be a string"))?;
		let values = if let Some(s) = v.unpack_str() {
			vec![s.to_string()]
		} else if let Some(list) = ListRef::from_value(v) {
			list.iter()
				.map(|i| {
					i.unpack_str()
						.map(str::to_string)
						.ok_or_else(|| anyhow!("header value must be a string"))
				})
				.collect::<Result<Vec<_>, _>>()?
		} else {
			return Err(anyhow!(
				"header `{}' value must be a string or list of strings",
				key
			));
		};
		out.push((key.to_string(), values));
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use starlark::values::dict::AllocDict;
	use starlark::values::{Heap, Value};

	use super::*;

	#[test]
	fn test_flatten_headers_single_and_list() {
		let heap = Heap::new();
		let single = heap.alloc("application/json");
		let list = heap.alloc(starlark::values::list::AllocList(["a", "b"]));
		let pairs: Vec<(Value, Value)> = vec![
			(heap.alloc("Content-Type"), single),
			(heap.alloc("X-Multi"), list),
		];
		let headers = heap.alloc(AllocDict(pairs));

		let out = flatten_headers(headers).unwrap();
		assert_eq!(
			out,
			vec![
				("Content-Type".to_string(), vec!["application/json".to_string()]),
				("X-Multi".to_string(), vec!["a".to_string(), "b".to_string()]),
			]
		);
	}

	#[test]
	fn test_flatten_headers_rejects_non_string() {
		let heap = Heap::new();
		let pairs: Vec<(Value, Value)> = vec![(heap.alloc("X"), heap.alloc(1))];
		let headers = heap.alloc(AllocDict(pairs));
		assert!(flatten_headers(headers).is_err());
	}
}
