//! Remote module dependencies: the deps-file format and the built-in
//! `git_repository` dependency kind.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::Context;
use starlark::any::ProvidesStaticType;
use starlark::environment::{GlobalsBuilder, Module};
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::syntax::{AstModule, Dialect};
use starlark::values::none::NoneType;
use thiserror::Error;

/// Default deps manifest name, picked up from the working directory when
/// `--deps` is not set.
pub const DEPS_FILE: &str = "amphipod.deps";

/// Errors produced while fetching a remote dependency.
#[derive(Debug, Error)]
pub enum FetchError {
	#[error("failed to clone git repo `{name}': {detail}")]
	Clone { name: String, detail: String },

	#[error("failed to prepare dependency workspace")]
	Io(#[from] std::io::Error),
}

/// A remote module source registered from the deps file.
pub trait Dependency: Send + Sync {
	/// Download the source. Must be idempotent; a commit-pinned checkout
	/// that already exists is left untouched.
	fn fetch(&self) -> Result<(), FetchError>;

	fn name(&self) -> &str;

	fn version(&self) -> &str;

	/// Directory storing the fetched source.
	fn local_dir(&self) -> PathBuf;
}

/// Git dependency pinned to a commit sha, fetched into
/// `<workspace>/<name>/<commit>`.
pub struct GitRepository {
	name: String,
	remote: String,
	commit: String,
	workspace: PathBuf,
}

impl GitRepository {
	pub fn new(name: String, remote: String, commit: String, workspace: PathBuf) -> Self {
		Self { name, remote, commit, workspace }
	}

	fn git(&self, dir: &Path, args: &[&str]) -> Result<(), FetchError> {
		let output = Command::new("git")
			.args(args)
			.current_dir(dir)
			.output()
			.map_err(FetchError::Io)?;
		if !output.status.success() {
			return Err(FetchError::Clone {
				name: self.name.clone(),
				detail: String::from_utf8_lossy(&output.stderr).into_owned(),
			});
		}
		Ok(())
	}
}

impl Dependency for GitRepository {
	fn fetch(&self) -> Result<(), FetchError> {
		let dir = self.local_dir();
		// The directory is keyed by commit sha, so its existence means the
		// dependency version is unchanged.
		if dir.exists() {
			return Ok(());
		}
		std::fs::create_dir_all(&dir)?;

		let result = (|| {
			self.git(&dir, &["init"])?;
			self.git(&dir, &["remote", "add", "origin", &self.remote])?;

			// A ref may point directly at the commit (fresh pushes); fetch
			// just that first, otherwise fall back to full history.
			let pinned = self
				.git(&dir, &["fetch", "origin", &self.commit])
				.and_then(|()| self.git(&dir, &["reset", "--hard", "FETCH_HEAD"]));
			if pinned.is_err() {
				self.git(&dir, &["fetch", "origin"])?;
				self.git(&dir, &["checkout", &self.commit])?;
			}
			Ok(())
		})();

		if result.is_err() {
			// Leave no partial checkout behind; the next fetch must retry.
			let _ = std::fs::remove_dir_all(&dir);
		}
		result
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn version(&self) -> &str {
		&self.commit
	}

	fn local_dir(&self) -> PathBuf {
		self.workspace.join(&self.name).join(&self.commit)
	}
}

/// All registered dependencies. Built once at startup from the deps file
/// and never mutated after addon loading begins.
#[derive(Default)]
pub struct DepsRegistry {
	deps: HashMap<String, Arc<dyn Dependency>>,
}

impl DepsRegistry {
	pub fn register(&mut self, dep: Arc<dyn Dependency>) {
		self.deps.insert(dep.name().to_string(), dep);
	}

	pub fn get(&self, name: &str) -> Option<Arc<dyn Dependency>> {
		self.deps.get(name).cloned()
	}

	pub fn is_empty(&self) -> bool {
		self.deps.is_empty()
	}
}

#[derive(ProvidesStaticType, Default)]
struct DepsCollector {
	found: RefCell<Vec<(String, String, String)>>,
}

#[starlark_module]
fn deps_globals(builder: &mut GlobalsBuilder) {
	/// Declare a git repository pinned to a commit sha.
	fn git_repository<'v>(
		#[starlark(require = named)] name: &str,
		#[starlark(require = named)] remote: &str,
		#[starlark(require = named)] commit: &str,
		eval: &mut Evaluator<'v, '_>,
	) -> anyhow::Result<NoneType> {
		let collector = eval
			.extra
			.and_then(|e| e.downcast_ref::<DepsCollector>())
			.ok_or_else(|| anyhow::anyhow!("git_repository is only allowed in the deps file"))?;
		collector.found.borrow_mut().push((
			name.to_string(),
			remote.to_string(),
			commit.to_string(),
		));
		Ok(NoneType)
	}
}

/// Evaluate a deps file in a restricted context and register each declared
/// dependency. The workspace for checkouts lives next to the deps file.
pub fn load_deps_file(path: &Path) -> anyhow::Result<DepsRegistry> {
	let source = std::fs::read_to_string(path)
		.with_context(|| format!("reading deps file {}", path.display()))?;
	let workspace = path
		.parent()
		.unwrap_or_else(|| Path::new("."))
		.join(".amphipod");

	let globals = {
		let mut builder = GlobalsBuilder::standard();
		deps_globals(&mut builder);
		builder.build()
	};

	let collector = DepsCollector::default();
	{
		let ast = AstModule::parse(&path.display().to_string(), source, &Dialect::Extended)
			.map_err(|e| anyhow::anyhow!("parsing deps file: {}", e))?;
		let module = Module::new();
		let mut eval = Evaluator::new(&module);
		eval.extra = Some(&collector);
		eval.eval_module(ast, &globals)
			.map_err(|e| anyhow::anyhow!("evaluating deps file: {}", e))?;
	}

	let mut registry = DepsRegistry::default();
	for (name, remote, commit) in collector.found.into_inner() {
		registry.register(Arc::new(GitRepository::new(
			name,
			remote,
			commit,
			workspace.clone(),
		)));
	}
	Ok(registry)
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;

	#[test]
	fn test_load_deps_file() {
		let dir = tempfile::tempdir().unwrap();
		let deps_path = dir.path().join(DEPS_FILE);
		fs::write(
			&deps_path,
			r#"git_repository(
    name = "common",
    remote = "https://example.com/common.git",
    commit = "0123456789abcdef0123456789abcdef01234567",
)
"#,
		)
		.unwrap();

		let registry = load_deps_file(&deps_path).unwrap();
		let dep = registry.get("common").unwrap();
		assert_eq!(dep.version(), "0123456789abcdef0123456789abcdef01234567");
		assert!(dep
			.local_dir()
			.ends_with(".amphipod/common/0123456789abcdef0123456789abcdef01234567"));
	}

	#[test]
	fn test_deps_file_rejects_missing_field() {
		let dir = tempfile::tempdir().unwrap();
		let deps_path = dir.path().join(DEPS_FILE);
		fs::write(&deps_path, "git_repository(name = \"x\")\n").unwrap();
		assert!(load_deps_file(&deps_path).is_err());
	}

	#[test]
	fn test_git_fetch_skips_existing_dir() {
		let dir = tempfile::tempdir().unwrap();
		let dep = GitRepository::new(
			"x".into(),
			"https://invalid.invalid/x.git".into(),
			"deadbeef".into(),
			dir.path().to_path_buf(),
		);
		fs::create_dir_all(dep.local_dir()).unwrap();
		// The checkout directory exists, so no network access happens.
		dep.fetch().unwrap();
	}
}
