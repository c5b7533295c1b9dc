//! Module loader: resolves `load(...)` statements with load-once caching,
//! cycle detection, and remote-dependency (`@dep//path`) support.

pub mod deps;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use starlark::environment::{FrozenModule, Globals, Module};
use starlark::eval::{Evaluator, FileLoader};
use starlark::syntax::{AstModule, Dialect};

use crate::bridge::StderrPrinter;
use crate::MODULE_EXTENSIONS;
use deps::DepsRegistry;

static PRINTER: StderrPrinter = StderrPrinter;

enum CacheEntry {
	/// Placeholder installed while a module evaluates; hitting it again
	/// means the load graph has a cycle.
	Loading,
	Done(Result<FrozenModule, String>),
}

#[derive(Default)]
struct LoaderState {
	cache: HashMap<String, CacheEntry>,
	/// Resolved path → source text, for rollout snapshots.
	sources: HashMap<String, String>,
	/// Module string → remote dependency version.
	versions: HashMap<String, String>,
	/// Directory of the module currently evaluating; loads resolve
	/// relative to the importing module.
	dir_stack: Vec<PathBuf>,
}

/// Loads modules for one addon. Repeated loads of the same resolved path
/// return the cached module, including a cached evaluation error.
pub struct ModulesLoader {
	base_dir: PathBuf,
	globals: Globals,
	deps: Arc<DepsRegistry>,
	state: RefCell<LoaderState>,
}

impl ModulesLoader {
	pub fn new(base_dir: PathBuf, globals: Globals, deps: Arc<DepsRegistry>) -> Self {
		Self {
			base_dir,
			globals,
			deps,
			state: RefCell::new(LoaderState::default()),
		}
	}

	/// Load a module by path, as `load(...)` statements do.
	pub fn load_module(&self, module: &str) -> anyhow::Result<FrozenModule> {
		check_extension(module)?;

		let (path, version) = self.resolve(module)?;
		let key = path.to_string_lossy().into_owned();

		{
			let state = self.state.borrow();
			match state.cache.get(&key) {
				Some(CacheEntry::Loading) => bail!("cycle in load graph"),
				Some(CacheEntry::Done(Ok(m))) => return Ok(m.clone()),
				Some(CacheEntry::Done(Err(e))) => bail!("{}", e),
				None => {}
			}
		}
		self.state.borrow_mut().cache.insert(key.clone(), CacheEntry::Loading);

		let result = self.read_and_exec(module, &path, version);

		let entry = match &result {
			Ok(m) => CacheEntry::Done(Ok(m.clone())),
			Err(e) => CacheEntry::Done(Err(format!("{:#}", e))),
		};
		self.state.borrow_mut().cache.insert(key, entry);
		result
	}

	/// Resolve a module string to a filesystem path, following symlinks.
	/// `@dep//rest` selects a registered remote dependency and fetches it
	/// on first use.
	fn resolve(&self, module: &str) -> anyhow::Result<(PathBuf, Option<String>)> {
		let (base, rest, version) = if let Some(stripped) = module.strip_prefix('@') {
			let idx = stripped
				.find("//")
				.ok_or_else(|| anyhow!("remote module must contain double slash"))?;
			let dep_name = &stripped[..idx];
			let dep = self
				.deps
				.get(dep_name)
				.ok_or_else(|| anyhow!("`{}' is not registered", dep_name))?;
			tracing::info!(dep = dep_name, "fetching module");
			dep.fetch()?;
			(dep.local_dir(), &stripped[idx + 2..], Some(dep.version().to_string()))
		} else {
			let base = self
				.state
				.borrow()
				.dir_stack
				.last()
				.cloned()
				.unwrap_or_else(|| self.base_dir.clone());
			(base, module, None)
		};

		let path = base.join(rest);
		let path = std::fs::canonicalize(&path)
			.with_context(|| format!("resolving module `{}' at {}", module, path.display()))?;
		Ok((path, version))
	}

	fn read_and_exec(
		&self,
		module: &str,
		path: &Path,
		version: Option<String>,
	) -> anyhow::Result<FrozenModule> {
		let source = std::fs::read_to_string(path)
			.with_context(|| format!("reading module {}", path.display()))?;

		{
			let mut state = self.state.borrow_mut();
			state
				.sources
				.insert(path.to_string_lossy().into_owned(), source.clone());
			if let Some(version) = version {
				state.versions.insert(module.to_string(), version);
			}
			let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
			state.dir_stack.push(dir);
		}

		let result = self.exec(path, source);
		self.state.borrow_mut().dir_stack.pop();
		result
	}

	fn exec(&self, path: &Path, source: String) -> anyhow::Result<FrozenModule> {
		let ast = AstModule::parse(&path.display().to_string(), source, &Dialect::Extended)
			.map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))?;
		let module = Module::new();
		{
			let mut eval = Evaluator::new(&module);
			eval.set_loader(self);
			eval.set_print_handler(&PRINTER);
			eval.eval_module(ast, &self.globals)
				.map_err(|e| anyhow::anyhow!("evaluating {}: {}", path.display(), e))?;
		}
		module.freeze()
	}

	/// Mapping of loaded module paths to their source text.
	pub fn loaded_sources(&self) -> HashMap<String, String> {
		self.state.borrow().sources.clone()
	}

	/// Version of a loaded remote module, if any.
	pub fn module_version(&self, module: &str) -> Option<String> {
		self.state.borrow().versions.get(module).cloned()
	}
}

impl FileLoader for ModulesLoader {
	fn load(&self, path: &str) -> anyhow::Result<FrozenModule> {
		self.load_module(path)
	}
}

fn check_extension(module: &str) -> anyhow::Result<()> {
	let ext = Path::new(module)
		.extension()
		.and_then(|e| e.to_str())
		.unwrap_or_default();
	if !MODULE_EXTENSIONS.contains(&ext) {
		bail!("unknown file extension: .{}", ext);
	}
	Ok(())
}
