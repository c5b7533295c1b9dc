//! Encoding builtins: `base64`, deterministic `uuid` digests, and `hash`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use starlark::environment::GlobalsBuilder;
use starlark::starlark_module;
use uuid::Uuid;

/// Register the `base64`, `uuid` and `hash` modules.
pub fn register(builder: &mut GlobalsBuilder) {
	builder.struct_("base64", base64_module);
	builder.struct_("uuid", uuid_module);
	builder.struct_("hash", hash_module);
}

#[starlark_module]
fn base64_module(builder: &mut GlobalsBuilder) {
	/// RFC 4648 standard encoding.
	fn encode(s: &str) -> anyhow::Result<String> {
		Ok(STANDARD.encode(s.as_bytes()))
	}

	fn decode(s: &str) -> anyhow::Result<String> {
		let bytes = STANDARD
			.decode(s)
			.map_err(|e| anyhow::anyhow!("failed to decode base64 string: {}", e))?;
		String::from_utf8(bytes)
			.map_err(|e| anyhow::anyhow!("decoded data is not valid UTF-8: {}", e))
	}
}

#[starlark_module]
fn uuid_module(builder: &mut GlobalsBuilder) {
	/// Deterministic MD5 digest seeded with the all-zero UUID.
	fn v3(s: &str) -> anyhow::Result<String> {
		Ok(Uuid::new_v3(&Uuid::nil(), s.as_bytes()).to_string())
	}

	/// Random UUID.
	fn v4() -> anyhow::Result<String> {
		Ok(Uuid::new_v4().to_string())
	}

	/// Deterministic SHA-1 digest seeded with the all-zero UUID.
	fn v5(s: &str) -> anyhow::Result<String> {
		Ok(Uuid::new_v5(&Uuid::nil(), s.as_bytes()).to_string())
	}
}

#[starlark_module]
fn hash_module(builder: &mut GlobalsBuilder) {
	fn sha256(s: &str) -> anyhow::Result<u64> {
		Ok(digest_prefix(&Sha256::digest(s.as_bytes())))
	}

	fn sha1(s: &str) -> anyhow::Result<u64> {
		Ok(digest_prefix(&Sha1::digest(s.as_bytes())))
	}

	fn md5(s: &str) -> anyhow::Result<u64> {
		Ok(digest_prefix(&Md5::digest(s.as_bytes())))
	}
}

/// Integer digest: the first eight bytes, big-endian.
fn digest_prefix(digest: &[u8]) -> u64 {
	let mut buf = [0u8; 8];
	buf.copy_from_slice(&digest[..8]);
	u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
	use super::super::tests::eval_repr;

	#[test]
	fn test_base64_round_trip() {
		assert_eq!(eval_repr(r#"base64.encode("amphipod")"#).unwrap(), "YW1waGlwb2Q=");
		assert_eq!(
			eval_repr(r#"base64.decode(base64.encode("amphipod"))"#).unwrap(),
			"amphipod"
		);
	}

	#[test]
	fn test_base64_decode_rejects_garbage() {
		assert!(eval_repr(r#"base64.decode("!!!")"#).is_err());
	}

	#[test]
	fn test_uuid_v3_v5_deterministic() {
		let a = eval_repr(r#"uuid.v3("addon")"#).unwrap();
		let b = eval_repr(r#"uuid.v3("addon")"#).unwrap();
		assert_eq!(a, b);

		let a5 = eval_repr(r#"uuid.v5("addon")"#).unwrap();
		assert_ne!(a, a5);
	}

	#[test]
	fn test_uuid_v4_random() {
		let a = eval_repr("uuid.v4()").unwrap();
		let b = eval_repr("uuid.v4()").unwrap();
		assert_ne!(a, b);
		assert_eq!(a.len(), 36);
	}

	#[test]
	fn test_hash_digests_are_stable() {
		let a = eval_repr(r#"hash.sha256("x")"#).unwrap();
		let b = eval_repr(r#"hash.sha256("x")"#).unwrap();
		assert_eq!(a, b);
		assert_ne!(eval_repr(r#"hash.sha1("x")"#).unwrap(), a);
		assert_ne!(eval_repr(r#"hash.md5("x")"#).unwrap(), a);
	}
}
