//! Script runtime bridge: exposes native capabilities to the evaluator and
//! carries per-execution state (cancellation token, active addon context,
//! capability set) through the evaluator's extra slot.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use serde_json::Value as Json;
use starlark::any::ProvidesStaticType;
use starlark::environment::{FrozenModule, Globals, GlobalsBuilder, Module};
use starlark::eval::{Evaluator, FileLoader};
use starlark::values::Value;
use starlark::PrintHandler;
use tokio_util::sync::CancellationToken;

use crate::cloud;
use crate::context::{ctx_data_to_json, CtxData, SkyCtx};
use crate::helm::HelmFacade;
use crate::k8s::{self, ApplyEngine};
use crate::modules;
use crate::secrets::SecretsBackend;

/// The capability set available to builtins during one execution.
#[derive(Default)]
pub struct Capabilities {
	pub kube: Option<Arc<ApplyEngine>>,
	pub secrets: Option<Arc<dyn SecretsBackend>>,
	pub helm: Option<Arc<HelmFacade>>,
	pub http: Option<reqwest::Client>,
	pub cloud: cloud::CloudConfig,
}

/// Per-execution state reachable from every builtin. The bridge populates
/// this before calling into the script and it travels on the evaluator.
#[derive(ProvidesStaticType)]
pub struct BridgeExtra {
	handle: tokio::runtime::Handle,
	pub cancel: CancellationToken,
	pub ctx: Arc<CtxData>,
	pub caps: Arc<Capabilities>,
}

impl BridgeExtra {
	pub fn new(
		handle: tokio::runtime::Handle,
		cancel: CancellationToken,
		ctx: Arc<CtxData>,
		caps: Arc<Capabilities>,
	) -> Self {
		Self { handle, cancel, ctx, caps }
	}

	/// Recover the bridge state from an evaluator. Fails when a capability
	/// builtin is called outside a bridged execution (module load time).
	pub fn from_eval<'v, 'a>(eval: &Evaluator<'v, 'a>) -> anyhow::Result<&'a BridgeExtra> {
		eval.extra
			.ok_or_else(|| anyhow!("builtin is not available in this context"))?
			.downcast_ref::<BridgeExtra>()
			.ok_or_else(|| anyhow!("builtin is not available in this context"))
	}

	/// Drive an engine future to completion from sync builtin code.
	pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
		self.handle.block_on(fut)
	}

	/// Snapshot of the active addon context as a JSON object.
	pub fn ctx_json(&self) -> Json {
		ctx_data_to_json(&self.ctx)
	}

	pub fn kube(&self) -> anyhow::Result<&Arc<ApplyEngine>> {
		self.caps.kube.as_ref().ok_or_else(|| anyhow!("kube is not available in this context"))
	}

	pub fn secrets(&self) -> anyhow::Result<&Arc<dyn SecretsBackend>> {
		self.caps
			.secrets
			.as_ref()
			.ok_or_else(|| anyhow!("secrets is not available in this context"))
	}

	pub fn helm(&self) -> anyhow::Result<&Arc<HelmFacade>> {
		self.caps.helm.as_ref().ok_or_else(|| anyhow!("helm is not available in this context"))
	}

	pub fn http(&self) -> anyhow::Result<&reqwest::Client> {
		self.caps.http.as_ref().ok_or_else(|| anyhow!("http is not available in this context"))
	}
}

/// Builder with every amphipod builtin registered. Callers may add more
/// (the unit-test driver registers `assert`) before building.
pub fn globals_builder() -> GlobalsBuilder {
	let mut builder = GlobalsBuilder::standard();
	modules::register(&mut builder);
	modules::http::register(&mut builder);
	k8s::builtin::register(&mut builder);
	crate::secrets::register(&mut builder);
	crate::helm::register(&mut builder);
	cloud::register(&mut builder);
	crate::addon::register(&mut builder);
	builder
}

/// The standard amphipod globals.
pub fn globals() -> Globals {
	globals_builder().build()
}

/// Routes script `print()` output to stderr.
pub struct StderrPrinter;

impl PrintHandler for StderrPrinter {
	fn println(&self, text: &str) -> anyhow::Result<()> {
		eprintln!("{}", text);
		Ok(())
	}
}

static PRINTER: StderrPrinter = StderrPrinter;

/// Call a module-level function with a context argument, handing the raw
/// return value to `extract` while the evaluation heap is still alive.
pub fn call_with_ctx<T>(
	frozen: &FrozenModule,
	fn_name: &str,
	ctx: Arc<CtxData>,
	extra: &BridgeExtra,
	loader: &dyn FileLoader,
	extract: impl FnOnce(Value) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
	let fun = frozen
		.get(fn_name)
		.with_context(|| format!("no `{}' function found", fn_name))?;

	let module = Module::new();
	let ctx_value = module.heap().alloc(SkyCtx::from_shared(ctx));

	let mut eval = Evaluator::new(&module);
	eval.set_loader(loader);
	eval.set_print_handler(&PRINTER);
	eval.extra = Some(extra);

	let ret = eval
		.eval_function(fun.value(), &[ctx_value], &[])
		.map_err(|e| anyhow!("error when calling `{}': {}", fn_name, e))?;

	extract(ret)
}
