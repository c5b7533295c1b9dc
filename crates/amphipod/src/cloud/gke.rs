//! GKE clusters: REST configuration through the Container API, with a
//! service-account JWT token exchange.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use allocative::Allocative;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use indexmap::IndexMap;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use starlark::any::ProvidesStaticType;
use starlark::collections::SmallMap;
use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::starlark_simple_value;
use starlark::values::{starlark_value, Heap, NoSerialize, StarlarkValue, Value};

use super::onprem::kwargs_to_fields;
use super::{merged_ctx, CloudConfig, KubernetesVendor};
use crate::bridge::BridgeExtra;
use crate::context::CtxData;
use crate::values::json_to_value;

/// Fields every `gke(...)` value must carry.
const REQUIRED_FIELDS: &[&str] = &["cluster", "project", "location"];

const TOKEN_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Script value produced by `gke(**kwargs)`.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct GkeValue {
	#[allocative(skip)]
	fields: IndexMap<String, Json>,
	#[allocative(skip)]
	sa_key: Option<PathBuf>,
	user_agent: String,
}

starlark_simple_value!(GkeValue);

impl GkeValue {
	pub fn to_vendor(&self) -> GkeVendor {
		GkeVendor {
			fields: self.fields.clone(),
			sa_key: self.sa_key.clone(),
			user_agent: self.user_agent.clone(),
		}
	}
}

impl fmt::Display for GkeValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<gke: {:?}>", self.fields)
	}
}

#[starlark_value(type = "gke")]
impl<'v> StarlarkValue<'v> for GkeValue {
	fn get_attr(&self, attribute: &str, heap: &'v Heap) -> Option<Value<'v>> {
		match self.fields.get(attribute) {
			Some(v) => Some(json_to_value(heap, v)),
			None => Some(Value::new_none()),
		}
	}

	fn has_attr(&self, _attribute: &str, _heap: &'v Heap) -> bool {
		true
	}
}

/// Native GKE vendor.
pub struct GkeVendor {
	fields: IndexMap<String, Json>,
	sa_key: Option<PathBuf>,
	user_agent: String,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
	client_email: String,
	private_key: String,
	token_uri: String,
}

#[derive(Serialize)]
struct TokenClaims<'a> {
	iss: &'a str,
	scope: &'a str,
	aud: &'a str,
	iat: u64,
	exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
	access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterInfo {
	endpoint: String,
	master_auth: MasterAuth,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MasterAuth {
	cluster_ca_certificate: String,
}

impl GkeVendor {
	fn field(&self, name: &str) -> anyhow::Result<&str> {
		self.fields
			.get(name)
			.and_then(Json::as_str)
			.ok_or_else(|| anyhow!("<gke> requires field `{}'", name))
	}

	/// Exchange the service-account key for a bearer token.
	async fn access_token(&self, client: &reqwest::Client) -> anyhow::Result<String> {
		let key_path = self
			.sa_key
			.as_ref()
			.ok_or_else(|| anyhow!("gke auth requires --sa_key"))?;
		let raw = tokio::fs::read_to_string(key_path)
			.await
			.with_context(|| format!("reading service account key {}", key_path.display()))?;
		let key: ServiceAccountKey =
			serde_json::from_str(&raw).context("parsing service account key")?;

		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.expect("clock before epoch")
			.as_secs();
		let claims = TokenClaims {
			iss: &key.client_email,
			scope: TOKEN_SCOPE,
			aud: &key.token_uri,
			iat: now,
			exp: now + 3600,
		};
		let jwt = encode(
			&Header::new(Algorithm::RS256),
			&claims,
			&EncodingKey::from_rsa_pem(key.private_key.as_bytes())
				.context("parsing service account private key")?,
		)
		.context("signing token request")?;

		let resp = client
			.post(&key.token_uri)
			.form(&[
				("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
				("assertion", &jwt),
			])
			.send()
			.await
			.context("requesting access token")?;
		if !resp.status().is_success() {
			bail!("token exchange returned {}", resp.status());
		}
		let token: TokenResponse = resp.json().await.context("parsing token response")?;
		Ok(token.access_token)
	}
}

#[async_trait]
impl KubernetesVendor for GkeVendor {
	async fn kube_config(&self) -> anyhow::Result<kube::Config> {
		let project = self.field("project")?;
		let location = self.field("location")?;
		let cluster = self.field("cluster")?;

		let client = reqwest::Client::new();
		let token = self.access_token(&client).await?;

		let url = format!(
			"https://container.googleapis.com/v1/projects/{}/locations/{}/clusters/{}",
			project, location, cluster
		);
		let resp = client
			.get(&url)
			.bearer_auth(&token)
			.header(reqwest::header::USER_AGENT, &self.user_agent)
			.send()
			.await
			.context("querying Container API")?;
		if !resp.status().is_success() {
			bail!("Container API returned {} for {}", resp.status(), url);
		}
		let info: ClusterInfo = resp.json().await.context("parsing cluster info")?;

		let kubeconfig = render_kubeconfig(
			&info.endpoint,
			&info.master_auth.cluster_ca_certificate,
			&token,
		);
		let kc: Kubeconfig =
			serde_yaml::from_str(&kubeconfig).context("building cluster kubeconfig")?;
		let config = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
			.await
			.context("building client config")?;
		Ok(config)
	}

	fn addon_ctx(&self, more: &IndexMap<String, String>) -> Arc<CtxData> {
		merged_ctx(&self.fields, more)
	}

	fn cluster_name(&self) -> String {
		self.fields
			.get("cluster")
			.and_then(Json::as_str)
			.unwrap_or("gke")
			.to_string()
	}
}

fn render_kubeconfig(endpoint: &str, ca: &str, token: &str) -> String {
	format!(
		r#"apiVersion: v1
kind: Config
clusters:
- name: gke
  cluster:
    server: https://{endpoint}
    certificate-authority-data: {ca}
contexts:
- name: gke
  context:
    cluster: gke
    user: gke
users:
- name: gke
  user:
    token: {token}
current-context: gke
"#
	)
}

/// Register the `gke` constructor.
pub fn register(builder: &mut GlobalsBuilder) {
	gke_builtin(builder);
}

#[starlark_module]
fn gke_builtin(builder: &mut GlobalsBuilder) {
	fn gke<'v>(
		#[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<GkeValue> {
		let fields = kwargs_to_fields(&kwargs)?;
		for required in REQUIRED_FIELDS {
			if !fields.contains_key(*required) {
				return Err(anyhow!("<gke> requires field `{}'", required));
			}
		}

		let cloud = BridgeExtra::from_eval(eval)
			.map(|e| e.caps.cloud.clone())
			.unwrap_or_else(|_| CloudConfig::default());
		Ok(GkeValue {
			fields,
			sa_key: cloud.sa_key,
			user_agent: cloud.user_agent,
		})
	}
}
