//! Top-level driver: iterates clusters returned by `clusters()`, then runs
//! the selected command over the addons each cluster declares.
//!
//! Clusters are visited in script order; addons within a cluster run
//! sequentially to keep API-server ordering and diffs deterministic. The
//! first addon failure stops its cluster but later clusters still run.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value as Json;
use starlark::values::list::ListRef;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::addon::Addon;
use crate::bridge::{self, call_with_ctx, BridgeExtra, Capabilities};
use crate::cloud::{self, CloudConfig, KubernetesVendor};
use crate::context::CtxData;
use crate::helm::{HelmCli, HelmFacade};
use crate::k8s::engine::EngineOptions;
use crate::k8s::ApplyEngine;
use crate::loader::deps::DepsRegistry;
use crate::loader::ModulesLoader;
use crate::secrets::{HttpSecrets, SecretsBackend};
use crate::store::{AddonRun, KubeStore, NoopStore, Store};

/// The driver command selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
	Install,
	Remove,
	List,
}

/// Everything the driver needs for one invocation.
pub struct DriverConfig {
	pub entry_file: PathBuf,
	pub command: Command,
	pub dry_run: bool,
	pub force: bool,
	pub diff: bool,
	pub diff_filters: Vec<String>,
	pub addon_regex: Option<Regex>,
	pub no_spin: bool,
	/// Namespace used by the rollout store.
	pub namespace: String,
	pub qps: u32,
	pub burst: u32,
	pub secret_token: String,
	pub cloud: CloudConfig,
	/// Base for `//`-prefixed chart paths; defaults to the entry file dir.
	pub rel_path: Option<PathBuf>,
	/// User-supplied context merged into every addon's context.
	pub user_ctx: IndexMap<String, String>,
}

/// One driver run over all clusters.
pub struct Driver {
	config: DriverConfig,
	deps: Arc<DepsRegistry>,
	runtime: tokio::runtime::Runtime,
	globals: starlark::environment::Globals,
	cancel: CancellationToken,
}

impl Driver {
	pub fn new(config: DriverConfig, deps: Arc<DepsRegistry>) -> anyhow::Result<Self> {
		let runtime = tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.build()
			.context("creating tokio runtime")?;

		let cancel = CancellationToken::new();
		{
			let cancel = cancel.clone();
			runtime.spawn(async move {
				if tokio::signal::ctrl_c().await.is_ok() {
					tracing::warn!("interrupt received, cancelling");
					cancel.cancel();
				}
			});
		}

		Ok(Self {
			config,
			deps,
			runtime,
			globals: bridge::globals(),
			cancel,
		})
	}

	fn entry_dir(&self) -> PathBuf {
		self.config
			.entry_file
			.parent()
			.map(PathBuf::from)
			.unwrap_or_else(|| PathBuf::from("."))
	}

	fn new_loader(&self) -> ModulesLoader {
		ModulesLoader::new(self.entry_dir(), self.globals.clone(), Arc::clone(&self.deps))
	}

	fn load_entry(
		&self,
		loader: &ModulesLoader,
	) -> anyhow::Result<starlark::environment::FrozenModule> {
		let entry = std::fs::canonicalize(&self.config.entry_file).with_context(|| {
			format!("resolving entry file {}", self.config.entry_file.display())
		})?;
		loader
			.load_module(&entry.to_string_lossy())
			.with_context(|| format!("loading entry file {}", entry.display()))
	}

	fn user_ctx_data(&self) -> Arc<CtxData> {
		let attrs: IndexMap<String, Json> = self
			.config
			.user_ctx
			.iter()
			.map(|(k, v)| (k.clone(), Json::String(v.clone())))
			.collect();
		Arc::new(std::sync::RwLock::new(attrs))
	}

	/// Run the configured command across all clusters. Returns false when
	/// at least one cluster saw an addon failure.
	pub fn run(&self) -> anyhow::Result<bool> {
		let loader = self.new_loader();
		let entry = self.load_entry(&loader)?;

		// The clusters() call gets the bare user context and a capability
		// set without cluster-bound services.
		let caps = Arc::new(Capabilities {
			http: Some(reqwest::Client::new()),
			cloud: self.config.cloud.clone(),
			..Default::default()
		});
		let user_ctx = self.user_ctx_data();
		let extra = BridgeExtra::new(
			self.runtime.handle().clone(),
			self.cancel.clone(),
			Arc::clone(&user_ctx),
			caps,
		);

		let vendors: Vec<Box<dyn KubernetesVendor>> =
			call_with_ctx(&entry, "clusters", user_ctx, &extra, &loader, |ret| {
				let list = ListRef::from_value(ret)
					.ok_or_else(|| anyhow!("clusters() must return a list (got a `{}')", ret.get_type()))?;
				let mut out = Vec::new();
				for item in list.iter() {
					match cloud::vendor_from_value(item) {
						Some(v) => out.push(v),
						None => tracing::error!(
							value = %item,
							"clusters() item is not a cluster vendor, skipping"
						),
					}
				}
				Ok(out)
			})
			.context("error when calling `clusters'")?;

		let mut failed = false;
		for vendor in vendors {
			println!("Current cluster: ({})", vendor.cluster_name());
			if let Err(e) = self.run_cluster(vendor.as_ref()) {
				// One failed addon stops its cluster but not the whole run.
				failed = true;
				tracing::error!(error = format!("{:#}", e), "addons run failed");
			}
		}
		Ok(!failed)
	}

	#[instrument(skip_all, fields(cluster = %vendor.cluster_name()))]
	fn run_cluster(&self, vendor: &dyn KubernetesVendor) -> anyhow::Result<()> {
		let handle = self.runtime.handle().clone();

		let kube_config = handle
			.block_on(vendor.kube_config())
			.context("building kube rest config")?;
		let client = kube::Client::try_from(kube_config).context("creating kube client")?;

		let engine = Arc::new(ApplyEngine::new(
			client.clone(),
			EngineOptions {
				dry_run: self.config.dry_run,
				force: self.config.force,
				diff: self.config.diff,
				diff_filters: self.config.diff_filters.clone(),
				qps: self.config.qps,
				burst: self.config.burst,
			},
		));

		let secrets: Option<Arc<dyn SecretsBackend>> = match std::env::var("VAULT_ADDR") {
			Ok(addr) if !addr.is_empty() => Some(Arc::new(HttpSecrets::new(
				reqwest::Client::new(),
				addr,
				self.config.secret_token.clone(),
			))),
			_ => None,
		};

		let helm_base = self.config.rel_path.clone().unwrap_or_else(|| self.entry_dir());
		let caps = Arc::new(Capabilities {
			kube: Some(Arc::clone(&engine)),
			secrets,
			helm: Some(Arc::new(HelmFacade::new(Box::new(HelmCli), helm_base))),
			http: Some(reqwest::Client::new()),
			cloud: self.config.cloud.clone(),
		});

		let store: Arc<dyn Store> = if self.config.dry_run {
			Arc::new(NoopStore)
		} else {
			Arc::new(KubeStore::new(client, &self.config.namespace))
		};

		// Fresh entry evaluation per cluster so addon declarations see this
		// cluster's context.
		let loader = self.new_loader();
		let entry = self.load_entry(&loader)?;
		let cluster_ctx = vendor.addon_ctx(&self.config.user_ctx);
		let extra = BridgeExtra::new(
			handle.clone(),
			self.cancel.clone(),
			Arc::clone(&cluster_ctx),
			Arc::clone(&caps),
		);

		let mut addons: Vec<Addon> =
			call_with_ctx(&entry, "addons", cluster_ctx, &extra, &loader, |ret| {
				let list = ListRef::from_value(ret)
					.ok_or_else(|| anyhow!("addons() must return a list (got a `{}')", ret.get_type()))?;
				let mut out = Vec::new();
				for item in list.iter() {
					out.push(Addon::from_value(item).ok_or_else(|| {
						anyhow!("{} is not an addon object (got a {})", item, item.get_type())
					})?);
				}
				Ok(out)
			})
			.context("error when calling `addons'")?;

		if let Some(re) = &self.config.addon_regex {
			addons.retain(|a| {
				let keep = re.is_match(&a.name);
				if !keep {
					tracing::debug!(addon = %a.name, "does not match filter regexp, skipping");
				}
				keep
			});
		}
		if addons.is_empty() {
			bail!("no addon matches the filter regexp");
		}

		// Each addon loads through its own loader so module caches and
		// source snapshots stay per-addon.
		let mut loaded = Vec::with_capacity(addons.len());
		for mut addon in addons {
			let addon_loader = self.new_loader();
			addon
				.load(&addon_loader)
				.with_context(|| format!("{} load failed", addon.display_pretty()))?;
			loaded.push((addon, addon_loader));
		}

		match self.config.command {
			Command::List => {
				let names: Vec<String> =
					loaded.iter().map(|(a, _)| a.display_pretty()).collect();
				println!("Configured addons:\n\t{}", names.join("\n\t"));
				Ok(())
			}
			Command::Install => self.install_all(&loaded, &caps, store.as_ref()),
			Command::Remove => {
				for (addon, loader) in &loaded {
					let extra = self.addon_extra(addon, &caps);
					addon.remove(&extra, loader)?;
				}
				Ok(())
			}
		}
	}

	fn addon_extra(&self, addon: &Addon, caps: &Arc<Capabilities>) -> BridgeExtra {
		BridgeExtra::new(
			self.runtime.handle().clone(),
			self.cancel.clone(),
			addon.ctx(),
			Arc::clone(caps),
		)
	}

	fn install_all(
		&self,
		addons: &[(Addon, ModulesLoader)],
		caps: &Arc<Capabilities>,
		store: &dyn Store,
	) -> anyhow::Result<()> {
		let spin = !self.config.no_spin && std::io::stderr().is_terminal();
		let install_one = |addon: &Addon, loader: &ModulesLoader| -> anyhow::Result<()> {
			let extra = self.addon_extra(addon, caps);
			if spin {
				with_spinner(&addon.name, || addon.install(&extra, loader))
			} else {
				addon.install(&extra, loader)
			}
		};

		if self.config.dry_run {
			for (addon, loader) in addons {
				install_one(addon, loader).context("failed addon installation")?;
			}
			return Ok(());
		}

		let handle = self.runtime.handle();
		let rollout = handle
			.block_on(store.create_rollout())
			.context("failed to initialize rollout state")?;
		println!("Beginning rollout [{}] installation...", rollout.id);

		for (addon, loader) in addons {
			install_one(addon, loader).context("failed addon installation")?;
			handle
				.block_on(store.put_addon_run(
					&rollout.id,
					&AddonRun {
						name: addon.name.clone(),
						modules: addon.loaded_modules(loader),
						data: Default::default(),
					},
				))
				.with_context(|| {
					format!("failed to store run state for `{}' addon", addon.name)
				})?;
		}

		handle
			.block_on(store.complete_rollout(&rollout.id))
			.context("failed to commit `live' rollout state")?;
		println!("Rollout [{}] is live!", rollout.id);
		Ok(())
	}
}

/// Run `f` while a spinner thread animates progress for `name`; the result
/// channel terminates the spinner.
fn with_spinner<T>(name: &str, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
	const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

	let (tx, rx) = mpsc::channel::<bool>();
	let label = name.to_string();
	let spinner = std::thread::spawn(move || {
		let mut i = 0usize;
		loop {
			match rx.recv_timeout(Duration::from_millis(100)) {
				Ok(ok) => {
					let status = if ok { "done" } else { "err" };
					eprintln!("\r Installing {}... {}", label, status);
					break;
				}
				Err(mpsc::RecvTimeoutError::Timeout) => {
					eprint!("\r Installing {}... {}", label, FRAMES[i % FRAMES.len()]);
					i += 1;
				}
				Err(mpsc::RecvTimeoutError::Disconnected) => break,
			}
		}
	});

	let res = f();
	let _ = tx.send(res.is_ok());
	let _ = spinner.join();
	res
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_with_spinner_returns_inner_result() {
		let ok: anyhow::Result<u32> = with_spinner("dns", || Ok(7));
		assert_eq!(ok.unwrap(), 7);

		let err: anyhow::Result<u32> = with_spinner("dns", || Err(anyhow!("boom")));
		assert!(err.is_err());
	}
}
