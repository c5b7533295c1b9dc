//! Secret store access: the `secrets` builtin package and its backends.
//!
//! The real backend talks to a remote key-value service over HTTP with a
//! bearer token; the in-memory backend serves unit-test mode.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{Map, Value as Json};
use starlark::collections::SmallMap;
use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::values::none::NoneType;
use starlark::values::Value;
use thiserror::Error;

use crate::bridge::BridgeExtra;
use crate::values::{json_to_value, value_to_json};

/// Errors produced by secret store backends.
#[derive(Debug, Error)]
pub enum SecretsError {
	#[error("request failed")]
	Transport(#[source] reqwest::Error),

	#[error("secret store returned {code}: {message}")]
	Server { code: u16, message: String },

	#[error("secret `{0}' not found")]
	NotFound(String),

	#[error("failed to parse secret data")]
	Parse(#[source] serde_json::Error),
}

/// One secret store. Paths are opaque slash-delimited strings.
#[async_trait]
pub trait SecretsBackend: Send + Sync {
	/// Read the secret payload stored at `path`.
	async fn read(&self, path: &str) -> Result<Json, SecretsError>;

	/// Read the raw JSON response at `path`.
	async fn read_raw(&self, path: &str) -> Result<Json, SecretsError>;

	/// Write a flat mapping to `path`.
	async fn write(&self, path: &str, data: Json) -> Result<(), SecretsError>;

	/// True if a secret exists at `path`.
	async fn exist(&self, path: &str) -> Result<bool, SecretsError>;
}

/// HTTP-backed secret store speaking the `/v1/<path>` protocol.
pub struct HttpSecrets {
	client: reqwest::Client,
	address: String,
	token: String,
}

impl HttpSecrets {
	/// Address comes from `$VAULT_ADDR`; the token from `--secret_token`.
	pub fn new(client: reqwest::Client, address: String, token: String) -> Self {
		Self { client, address, token }
	}

	fn url(&self, path: &str) -> String {
		format!("{}/v1/{}", self.address.trim_end_matches('/'), path)
	}

	async fn get(&self, path: &str) -> Result<reqwest::Response, SecretsError> {
		self.client
			.get(self.url(path))
			.bearer_auth(&self.token)
			.send()
			.await
			.map_err(SecretsError::Transport)
	}
}

#[async_trait]
impl SecretsBackend for HttpSecrets {
	async fn read(&self, path: &str) -> Result<Json, SecretsError> {
		let raw = self.read_raw(path).await?;
		Ok(raw.get("data").cloned().unwrap_or(Json::Null))
	}

	async fn read_raw(&self, path: &str) -> Result<Json, SecretsError> {
		let resp = self.get(path).await?;
		let code = resp.status().as_u16();
		if code == 404 {
			return Err(SecretsError::NotFound(path.to_string()));
		}
		let body = resp.text().await.map_err(SecretsError::Transport)?;
		if !(200..300).contains(&code) {
			return Err(SecretsError::Server { code, message: body });
		}
		serde_json::from_str(&body).map_err(SecretsError::Parse)
	}

	async fn write(&self, path: &str, data: Json) -> Result<(), SecretsError> {
		let resp = self
			.client
			.put(self.url(path))
			.bearer_auth(&self.token)
			.json(&data)
			.send()
			.await
			.map_err(SecretsError::Transport)?;
		let code = resp.status().as_u16();
		if !(200..300).contains(&code) {
			let message = resp.text().await.unwrap_or_default();
			return Err(SecretsError::Server { code, message });
		}
		Ok(())
	}

	async fn exist(&self, path: &str) -> Result<bool, SecretsError> {
		match self.read_raw(path).await {
			Ok(_) => Ok(true),
			Err(SecretsError::NotFound(_)) => Ok(false),
			Err(e) => Err(e),
		}
	}
}

/// In-memory secret store for unit-test mode.
#[derive(Default)]
pub struct FakeSecrets {
	store: RwLock<HashMap<String, Json>>,
}

impl FakeSecrets {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl SecretsBackend for FakeSecrets {
	async fn read(&self, path: &str) -> Result<Json, SecretsError> {
		self.store
			.read()
			.expect("secrets lock poisoned")
			.get(path)
			.cloned()
			.ok_or_else(|| SecretsError::NotFound(path.to_string()))
	}

	async fn read_raw(&self, path: &str) -> Result<Json, SecretsError> {
		let data = self.read(path).await?;
		let mut wrapper = Map::new();
		wrapper.insert("data".into(), data);
		Ok(Json::Object(wrapper))
	}

	async fn write(&self, path: &str, data: Json) -> Result<(), SecretsError> {
		self.store
			.write()
			.expect("secrets lock poisoned")
			.insert(path.to_string(), data);
		Ok(())
	}

	async fn exist(&self, path: &str) -> Result<bool, SecretsError> {
		Ok(self.store.read().expect("secrets lock poisoned").contains_key(path))
	}
}

/// Register the `secrets` package.
pub fn register(builder: &mut GlobalsBuilder) {
	builder.struct_("secrets", secrets_module);
}

#[starlark_module]
fn secrets_module(builder: &mut GlobalsBuilder) {
	/// Read a (potentially nested) mapping of secret data at `path`.
	fn read<'v>(path: &str, eval: &mut Evaluator<'v, '_>) -> anyhow::Result<Value<'v>> {
		let extra = BridgeExtra::from_eval(eval)?;
		let backend = extra.secrets()?;
		let data = extra.block_on(backend.read(path))?;
		Ok(json_to_value(eval.heap(), &data))
	}

	/// Read the raw JSON-decoded response at `path`.
	fn read_raw<'v>(path: &str, eval: &mut Evaluator<'v, '_>) -> anyhow::Result<Value<'v>> {
		let extra = BridgeExtra::from_eval(eval)?;
		let backend = extra.secrets()?;
		let data = extra.block_on(backend.read_raw(path))?;
		Ok(json_to_value(eval.heap(), &data))
	}

	/// Write `k=v` pairs to `path`. Values may be strings or lists of
	/// strings.
	fn write<'v>(
		path: &str,
		#[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneType> {
		let extra = BridgeExtra::from_eval(eval)?;
		let backend = extra.secrets()?;

		let mut data = Map::new();
		for (key, v) in kwargs.iter() {
			let value = value_to_json(*v)?;
			match &value {
				Json::String(_) => {}
				Json::Array(items) if items.iter().all(Json::is_string) => {}
				_ => {
					return Err(anyhow!(
						"secret value for `{}' must be a string or list of strings",
						key
					))
				}
			}
			data.insert(key.clone(), value);
		}

		extra.block_on(backend.write(path, Json::Object(data)))?;
		Ok(NoneType)
	}

	/// True if a secret exists at `path`; a 404 reads as False.
	fn exist<'v>(path: &str, eval: &mut Evaluator<'v, '_>) -> anyhow::Result<bool> {
		let extra = BridgeExtra::from_eval(eval)?;
		let backend = extra.secrets()?;
		Ok(extra.block_on(backend.exist(path))?)
	}
}
