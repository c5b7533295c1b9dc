//! Unit-test mode: discovers `*_test` script files, executes them with the
//! external services stubbed out, and runs every `test_*` function.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use allocative::Allocative;
use anyhow::Context;
use indexmap::IndexMap;
use kube_mock::MockK8sServer;
use starlark::any::ProvidesStaticType;
use starlark::environment::{GlobalsBuilder, Module};
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::starlark_simple_value;
use starlark::values::none::NoneType;
use starlark::values::{starlark_value, Heap, NoSerialize, StarlarkValue, Value};
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeExtra, Capabilities};
use crate::context::{CtxData, SkyCtx};
use crate::k8s::engine::EngineOptions;
use crate::k8s::ApplyEngine;
use crate::loader::deps::DepsRegistry;
use crate::loader::ModulesLoader;
use crate::secrets::FakeSecrets;
use crate::MODULE_EXTENSIONS;

/// Distinguished assertion failure raised by the `assert` builtin.
#[derive(Debug)]
pub struct AssertError {
	pub msg: String,
}

impl fmt::Display for AssertError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.msg.is_empty() {
			write!(f, "assertion failed")
		} else {
			write!(f, "assertion failed: {}", self.msg)
		}
	}
}

impl std::error::Error for AssertError {}

/// True when an error chain bottoms out in an assertion failure.
fn is_assert_error(err: &anyhow::Error) -> bool {
	err.chain().any(|e| e.is::<AssertError>()) || err.to_string().contains("assertion failed")
}

/// Register the test-only `assert` builtin.
pub fn register_assert(builder: &mut GlobalsBuilder) {
	assert_builtin(builder);
}

#[starlark_module]
fn assert_builtin(builder: &mut GlobalsBuilder) {
	/// Fail the current test when `cond` is false.
	fn assert(cond: bool, msg: Option<&str>) -> anyhow::Result<NoneType> {
		if !cond {
			return Err(anyhow::Error::new(AssertError {
				msg: msg.unwrap_or_default().to_string(),
			}));
		}
		Ok(NoneType)
	}
}

/// Test context object handed to every `test_*` function; wraps a fresh
/// addon context under `.ctx`.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
struct TestCtx {
	#[allocative(skip)]
	ctx: Arc<CtxData>,
}

starlark_simple_value!(TestCtx);

impl fmt::Display for TestCtx {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<test_ctx>")
	}
}

#[starlark_value(type = "test_ctx")]
impl<'v> StarlarkValue<'v> for TestCtx {
	fn get_attr(&self, attribute: &str, heap: &'v Heap) -> Option<Value<'v>> {
		match attribute {
			"ctx" => Some(heap.alloc(SkyCtx::from_shared(Arc::clone(&self.ctx)))),
			_ => None,
		}
	}

	fn dir_attr(&self) -> Vec<String> {
		vec!["ctx".to_string()]
	}
}

fn is_test_file(name: &str) -> bool {
	MODULE_EXTENSIONS
		.iter()
		.any(|ext| name.ends_with(&format!("_test.{}", ext)))
}

/// Collect test files for a path: `dir/...` walks recursively, a directory
/// lists its direct children, a matching file selects itself, and an empty
/// path searches the working directory recursively.
pub fn search(path: &str) -> anyhow::Result<Vec<PathBuf>> {
	let path = if path.is_empty() { "./...".to_string() } else { path.to_string() };

	let mut out = Vec::new();
	if let Some(root) = path.strip_suffix("/...") {
		let root = if root.is_empty() { "." } else { root };
		for entry in walkdir::WalkDir::new(root) {
			let entry = entry?;
			if entry.file_type().is_file()
				&& is_test_file(&entry.file_name().to_string_lossy())
			{
				out.push(entry.into_path());
			}
		}
	} else {
		let meta = std::fs::metadata(&path)
			.with_context(|| format!("reading test path {}", path))?;
		if meta.is_dir() {
			for entry in std::fs::read_dir(&path)? {
				let entry = entry?;
				if entry.file_type()?.is_file()
					&& is_test_file(&entry.file_name().to_string_lossy())
				{
					out.push(entry.path());
				}
			}
		} else if is_test_file(&path) {
			out.push(PathBuf::from(&path));
		}
	}

	out.sort();
	Ok(out)
}

/// Outcome of one test file.
struct FileResult {
	pass: bool,
	path: PathBuf,
	failure_msg: String,
	runtime: Duration,
}

/// Execute all test cases within one file against fresh fakes.
fn exec_file(
	handle: &tokio::runtime::Handle,
	path: &Path,
) -> anyhow::Result<FileResult> {
	let start = Instant::now();

	// Fake capability set: the real engine pointed at an in-memory API
	// server, plus an in-memory secret store.
	let server = handle.block_on(MockK8sServer::new().start());
	let engine = Arc::new(ApplyEngine::new(server.client(), EngineOptions::default()));
	let caps = Arc::new(Capabilities {
		kube: Some(engine),
		secrets: Some(Arc::new(FakeSecrets::new())),
		helm: None,
		http: Some(reqwest::Client::new()),
		cloud: Default::default(),
	});

	let globals = {
		let mut builder = crate::bridge::globals_builder();
		register_assert(&mut builder);
		builder.build()
	};

	let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
	let loader = ModulesLoader::new(dir, globals, Arc::new(DepsRegistry::default()));
	let abs = std::fs::canonicalize(path)?;
	let module = loader.load_module(&abs.to_string_lossy())?;

	let mut names: Vec<String> = module.names().map(|n| n.as_str().to_string()).collect();
	names.retain(|n| n.starts_with("test_"));

	for name in names {
		let fun = module.get(&name)?;

		let ctx: Arc<CtxData> = Arc::new(std::sync::RwLock::new(IndexMap::new()));
		let extra = BridgeExtra::new(
			handle.clone(),
			CancellationToken::new(),
			Arc::clone(&ctx),
			Arc::clone(&caps),
		);

		let eval_module = Module::new();
		let test_ctx = eval_module.heap().alloc(TestCtx { ctx });
		let result = {
			let mut eval = Evaluator::new(&eval_module);
			eval.set_loader(&loader);
			eval.extra = Some(&extra);
			eval.eval_function(fun.value(), &[test_ctx], &[])
		};

		if let Err(e) = result {
			let e = e.into_anyhow();
			if is_assert_error(&e) {
				return Ok(FileResult {
					pass: false,
					path: path.to_path_buf(),
					failure_msg: format!("{}", e),
					runtime: start.elapsed(),
				});
			}
			return Err(e.context(format!("running {}", name)));
		}
	}

	Ok(FileResult {
		pass: true,
		path: path.to_path_buf(),
		failure_msg: String::new(),
		runtime: start.elapsed(),
	})
}

/// Run all tests under `path`, writing results to `out` and hard errors to
/// `err_w`. Returns true when every file passed.
pub fn run_unit_tests<W: Write, E: Write>(
	path: &str,
	out: &mut W,
	err_w: &mut E,
) -> anyhow::Result<bool> {
	let files = search(path)?;
	if files.is_empty() {
		writeln!(out, "No tests found.")?;
		return Ok(true);
	}

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")?;
	let handle = runtime.handle().clone();

	let mut results = Vec::with_capacity(files.len());
	for file in files {
		match exec_file(&handle, &file) {
			Ok(res) => results.push(res),
			Err(e) => {
				writeln!(err_w, "{:#}", e)?;
				results.push(FileResult {
					pass: false,
					path: file,
					failure_msg: String::new(),
					runtime: Duration::ZERO,
				});
			}
		}
	}

	let mut status = true;
	for r in &results {
		if r.pass {
			writeln!(out, "ok\t{} {:?}", r.path.display(), r.runtime)?;
		} else {
			if !r.failure_msg.is_empty() {
				writeln!(out, "FAIL: {}", r.failure_msg)?;
			}
			writeln!(out, "FAIL\t{}", r.path.display())?;
			status = false;
		}
	}

	Ok(status)
}
