//! ConfigMap-backed rollout store: rollout and run records persist in the
//! target cluster itself, with owner references from run to rollout.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::instrument;

use super::{AddonRun, Rollout, Store, StoreError};

/// Name of the ConfigMap holding the live-rollout pointer.
const LIVE_POINTER: &str = "rollout-live";

/// Rollout store persisting ConfigMaps under one namespace.
pub struct KubeStore {
	api: Api<ConfigMap>,
}

impl KubeStore {
	pub fn new(client: Client, namespace: &str) -> Self {
		Self {
			api: Api::namespaced(client, namespace),
		}
	}

	fn new_id(prefix: &str) -> String {
		format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
	}

	fn rollout_from_cm(&self, cm: &ConfigMap, live_id: Option<&str>) -> Rollout {
		let id = cm.metadata.name.clone().unwrap_or_default();
		Rollout {
			live: live_id == Some(id.as_str()),
			runs: cm
				.data
				.clone()
				.unwrap_or_default()
				.into_iter()
				.collect::<HashMap<_, _>>(),
			id,
		}
	}

	async fn live_pointer(&self) -> Result<Option<ConfigMap>, StoreError> {
		Ok(self.api.get_opt(LIVE_POINTER).await?)
	}
}

#[async_trait]
impl Store for KubeStore {
	#[instrument(skip(self))]
	async fn create_rollout(&self) -> Result<Rollout, StoreError> {
		let cm = ConfigMap {
			metadata: ObjectMeta {
				name: Some(Self::new_id("rollout")),
				..Default::default()
			},
			..Default::default()
		};
		let created = self.api.create(&PostParams::default(), &cm).await?;
		Ok(Rollout {
			id: created.metadata.name.unwrap_or_default(),
			runs: HashMap::new(),
			live: false,
		})
	}

	#[instrument(skip(self, run), fields(addon = %run.name))]
	async fn put_addon_run(&self, rollout_id: &str, run: &AddonRun)
		-> Result<String, StoreError> {
		let mut rollout = self
			.api
			.get_opt(rollout_id)
			.await?
			.ok_or_else(|| StoreError::RolloutNotFound(rollout_id.to_string()))?;

		let modules = serde_yaml::to_string(&run.modules).map_err(StoreError::Encode)?;

		let owner = OwnerReference {
			api_version: "v1".to_string(),
			kind: "ConfigMap".to_string(),
			name: rollout_id.to_string(),
			uid: rollout.metadata.uid.clone().unwrap_or_default(),
			controller: Some(true),
			..Default::default()
		};

		let run_name = Self::new_id(&format!("{}-run", run.name));
		let run_cm = ConfigMap {
			metadata: ObjectMeta {
				name: Some(run_name.clone()),
				owner_references: Some(vec![owner]),
				labels: Some(
					[
						("addon".to_string(), run.name.clone()),
						("owner".to_string(), rollout_id.to_string()),
					]
					.into(),
				),
				..Default::default()
			},
			data: Some(BTreeMap::from([
				("addon".to_string(), run.name.clone()),
				("modules".to_string(), modules),
			])),
			binary_data: if run.data.is_empty() {
				None
			} else {
				Some(
					run.data
						.iter()
						.map(|(k, v)| (k.clone(), ByteString(v.clone())))
						.collect(),
				)
			},
			..Default::default()
		};
		self.api.create(&PostParams::default(), &run_cm).await?;

		// Link the run from the rollout record; one run per addon.
		let data = rollout.data.get_or_insert_with(BTreeMap::new);
		if data.contains_key(&run.name) {
			return Err(StoreError::DuplicateRun {
				addon: run.name.clone(),
				run: run_name,
			});
		}
		data.insert(run.name.clone(), run_name.clone());
		self.api
			.replace(rollout_id, &PostParams::default(), &rollout)
			.await?;

		Ok(run_name)
	}

	#[instrument(skip(self))]
	async fn complete_rollout(&self, rollout_id: &str) -> Result<(), StoreError> {
		match self.live_pointer().await? {
			None => {
				tracing::info!(rollout = rollout_id, "creating live rollout pointer");
				let cm = ConfigMap {
					metadata: ObjectMeta {
						name: Some(LIVE_POINTER.to_string()),
						labels: Some([("rollout".to_string(), "live".to_string())].into()),
						..Default::default()
					},
					data: Some(BTreeMap::from([(
						"rollout".to_string(),
						rollout_id.to_string(),
					)])),
					..Default::default()
				};
				self.api.create(&PostParams::default(), &cm).await?;
			}
			Some(mut live) => {
				let previous = live
					.data
					.as_ref()
					.and_then(|d| d.get("rollout").cloned())
					.unwrap_or_default();
				tracing::info!(
					previous = %previous,
					rollout = rollout_id,
					"replacing live rollout pointer"
				);
				live.data
					.get_or_insert_with(BTreeMap::new)
					.insert("rollout".to_string(), rollout_id.to_string());
				self.api.replace(LIVE_POINTER, &PostParams::default(), &live).await?;
			}
		}
		Ok(())
	}

	async fn get_live(&self) -> Result<Option<Rollout>, StoreError> {
		let Some(pointer) = self.live_pointer().await? else {
			return Ok(None);
		};
		let Some(id) = pointer.data.as_ref().and_then(|d| d.get("rollout").cloned()) else {
			return Ok(None);
		};
		self.get_rollout(&id).await
	}

	async fn get_rollout(&self, rollout_id: &str) -> Result<Option<Rollout>, StoreError> {
		let Some(cm) = self.api.get_opt(rollout_id).await? else {
			return Ok(None);
		};
		let live_id = self
			.live_pointer()
			.await?
			.and_then(|p| p.data.and_then(|d| d.get("rollout").cloned()));
		Ok(Some(self.rollout_from_cm(&cm, live_id.as_deref())))
	}
}
