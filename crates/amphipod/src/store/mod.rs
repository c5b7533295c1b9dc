//! Persistent store recording current and past addon rollouts.
//!
//! At most one rollout is "live" per store; completing a rollout atomically
//! swaps the live pointer.

pub mod kube;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use self::kube::KubeStore;

/// Errors produced by rollout stores.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("rollout store request failed")]
	Api(#[source] Box<::kube::Error>),

	#[error("rollout `{0}' not found")]
	RolloutNotFound(String),

	#[error("addon run for addon `{addon}' already exists: {run}")]
	DuplicateRun { addon: String, run: String },

	#[error("could not marshal addon modules")]
	Encode(#[source] serde_yaml::Error),
}

impl From<::kube::Error> for StoreError {
	fn from(e: ::kube::Error) -> Self {
		StoreError::Api(Box::new(e))
	}
}

/// Stored state of one addon run.
#[derive(Debug, Clone, Default)]
pub struct AddonRun {
	/// Addon associated with the run.
	pub name: String,
	/// Source snapshot: module path → source text.
	pub modules: HashMap<String, String>,
	/// Opaque data recorded by the addon during execution.
	pub data: HashMap<String, Vec<u8>>,
}

/// A single rollout: the set of addon runs from one install invocation.
#[derive(Debug, Clone)]
pub struct Rollout {
	pub id: String,
	/// Addon name → run id.
	pub runs: HashMap<String, String>,
	pub live: bool,
}

/// Rollout store interface.
#[async_trait]
pub trait Store: Send + Sync {
	/// Commit a new rollout with a fresh id.
	async fn create_rollout(&self) -> Result<Rollout, StoreError>;

	/// Record an addon run under a rollout.
	async fn put_addon_run(&self, rollout_id: &str, run: &AddonRun)
		-> Result<String, StoreError>;

	/// Mark a rollout live, demoting the previous live rollout.
	async fn complete_rollout(&self, rollout_id: &str) -> Result<(), StoreError>;

	/// The current live rollout, if any.
	async fn get_live(&self) -> Result<Option<Rollout>, StoreError>;

	/// A past or live rollout by id.
	async fn get_rollout(&self, rollout_id: &str) -> Result<Option<Rollout>, StoreError>;
}

/// Store that records nothing, for environments without persistent backing.
#[derive(Debug, Default)]
pub struct NoopStore;

#[async_trait]
impl Store for NoopStore {
	async fn create_rollout(&self) -> Result<Rollout, StoreError> {
		Ok(Rollout {
			id: format!("rollout-{}", uuid::Uuid::new_v4().simple()),
			runs: HashMap::new(),
			live: false,
		})
	}

	async fn put_addon_run(&self, _: &str, run: &AddonRun) -> Result<String, StoreError> {
		Ok(format!("{}-run-{}", run.name, uuid::Uuid::new_v4().simple()))
	}

	async fn complete_rollout(&self, _: &str) -> Result<(), StoreError> {
		Ok(())
	}

	async fn get_live(&self) -> Result<Option<Rollout>, StoreError> {
		Ok(None)
	}

	async fn get_rollout(&self, _: &str) -> Result<Option<Rollout>, StoreError> {
		Ok(None)
	}
}
