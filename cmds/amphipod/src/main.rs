use std::path::PathBuf;
use std::process::ExitCode;

use amphipod::cloud::CloudConfig;
use amphipod::driver::{Command as DriverCommand, Driver, DriverConfig};
use amphipod::loader::deps::{load_deps_file, DepsRegistry, DEPS_FILE};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "amphipod")]
#[command(about = "An addons installer framework", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,

	/// Print binary version/system information and exit.
	#[arg(long)]
	version: bool,

	/// Bearer token for the secret-store client.
	#[arg(long = "secret_token", global = true, default_value = "")]
	secret_token: String,

	/// Kubernetes namespace to store rollout metadata in.
	#[arg(long, global = true, default_value = "default")]
	namespace: String,

	/// Kubernetes client config path.
	#[arg(long, global = true)]
	kubeconfig: Option<PathBuf>,

	/// QPS to configure the kubernetes REST client.
	#[arg(long, global = true, default_value_t = 100)]
	qps: u32,

	/// Burst to configure the kubernetes REST client.
	#[arg(long, global = true, default_value_t = 100)]
	burst: u32,

	/// Filters configured addons based on the provided regex.
	#[arg(long = "match_addons", global = true)]
	match_addons: Option<String>,

	/// Comma-separated list of `foo=bar' context parameters passed to the
	/// clusters function.
	#[arg(long, global = true, default_value = "")]
	context: String,

	/// Print intended actions but don't mutate anything.
	#[arg(long = "dry_run", global = true)]
	dry_run: bool,

	/// Delete and recreate immutable resources without confirmation.
	#[arg(long, global = true)]
	force: bool,

	/// Path to the cloud service account json file.
	#[arg(long = "sa_key", global = true)]
	sa_key: Option<PathBuf>,

	/// Disables the command line status spinner.
	#[arg(long, global = true)]
	nospin: bool,

	/// Print diffs against live Kubernetes objects.
	#[arg(long = "kube_diff", global = true)]
	kube_diff: bool,

	/// Filter elements in diffs using k-path key matching.
	#[arg(long = "kube_diff_filter", global = true)]
	kube_diff_filter: Vec<String>,

	/// Path to a file of filters delimited by new lines.
	#[arg(long = "kube_diff_filter_file", global = true)]
	kube_diff_filter_file: Option<PathBuf>,

	/// The base path used to interpret the double slash prefix.
	#[arg(long = "rel_path", global = true)]
	rel_path: Option<PathBuf>,

	/// Path to the dependency manifest.
	#[arg(long, global = true)]
	deps: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
	/// Install addons.
	Install { path: PathBuf },

	/// Uninstall addons.
	Remove { path: PathBuf },

	/// List addons in the entry file.
	List { path: PathBuf },

	/// Run unit tests found under the given path.
	Test {
		#[arg(default_value = "")]
		path: String,
	},

	/// Generate a script addon file from a yaml or json manifest.
	Generate { path: String },
}

/// Initialize tracing. Known-noisy dependency targets are capped at warn so
/// addon output stays readable.
fn init_logger() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		EnvFilter::new("info")
			.add_directive("hyper=warn".parse().expect("static directive"))
			.add_directive("tower=warn".parse().expect("static directive"))
			.add_directive("rustls=warn".parse().expect("static directive"))
			.add_directive("kube_client=warn".parse().expect("static directive"))
	});

	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_logfmt::layer())
		.init();
}

fn load_dependencies(cli: &Cli) -> Result<DepsRegistry> {
	if let Some(path) = &cli.deps {
		tracing::info!(path = %path.display(), "loading dependencies");
		return load_deps_file(path);
	}
	let default_path = std::env::current_dir()?.join(DEPS_FILE);
	if default_path.exists() {
		tracing::info!(path = %default_path.display(), "loading dependencies");
		return load_deps_file(&default_path);
	}
	tracing::debug!("using no remote modules");
	Ok(DepsRegistry::default())
}

fn diff_filters(cli: &Cli) -> Result<Vec<String>> {
	let mut filters = Vec::new();
	if let Some(path) = &cli.kube_diff_filter_file {
		filters.extend(amphipod::util::load_filter_file(path).context("loading diff filters")?);
	}
	filters.extend(cli.kube_diff_filter.iter().cloned());
	Ok(filters)
}

fn driver_config(cli: &Cli, command: DriverCommand, entry_file: PathBuf) -> Result<DriverConfig> {
	let addon_regex = match cli.match_addons.as_deref() {
		Some(pattern) if !pattern.is_empty() => {
			Some(Regex::new(pattern).context("invalid --match_addons regex")?)
		}
		_ => None,
	};

	Ok(DriverConfig {
		entry_file,
		command,
		dry_run: cli.dry_run,
		force: cli.force,
		diff: cli.kube_diff,
		diff_filters: diff_filters(cli)?,
		addon_regex,
		no_spin: cli.nospin,
		namespace: cli.namespace.clone(),
		qps: cli.qps,
		burst: cli.burst,
		secret_token: cli.secret_token.clone(),
		cloud: CloudConfig {
			sa_key: cli.sa_key.clone(),
			kubeconfig: cli.kubeconfig.clone(),
			user_agent: format!("Amphipod/{}", env!("CARGO_PKG_VERSION")),
		},
		rel_path: cli.rel_path.clone(),
		user_ctx: amphipod::util::parse_context_params(&cli.context)
			.context("invalid value to --context")?,
	})
}

fn run_driver(cli: &Cli, command: DriverCommand, entry_file: PathBuf) -> Result<ExitCode> {
	let deps = load_dependencies(cli)?;
	let config = driver_config(cli, command, entry_file)?;
	let driver = Driver::new(config, std::sync::Arc::new(deps))?;

	// Exit code 2 signals that at least one cluster saw an addon failure.
	match driver.run()? {
		true => Ok(ExitCode::SUCCESS),
		false => Ok(ExitCode::from(2)),
	}
}

fn run(cli: Cli) -> Result<ExitCode> {
	if cli.version {
		println!("Version: {}", env!("CARGO_PKG_VERSION"));
		println!("System: {}/{}", std::env::consts::OS, std::env::consts::ARCH);
		return Ok(ExitCode::SUCCESS);
	}

	let Some(command) = &cli.command else {
		anyhow::bail!("expected a command: install, remove, list, test, or generate");
	};

	match command {
		Commands::Install { path } => run_driver(&cli, DriverCommand::Install, path.clone()),
		Commands::Remove { path } => run_driver(&cli, DriverCommand::Remove, path.clone()),
		Commands::List { path } => run_driver(&cli, DriverCommand::List, path.clone()),
		Commands::Test { path } => {
			let mut stdout = std::io::stdout();
			let mut stderr = std::io::stderr();
			let ok = amphipod::unittest::run_unit_tests(path, &mut stdout, &mut stderr)
				.context("failed to run tests")?;
			Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
		}
		Commands::Generate { path } => {
			let mut stdout = std::io::stdout();
			amphipod::generate::generate(path, &mut stdout)
				.context("failed to generate script source")?;
			Ok(ExitCode::SUCCESS)
		}
	}
}

fn main() -> ExitCode {
	let cli = Cli::parse();
	init_logger();

	match run(cli) {
		Ok(code) => code,
		Err(e) => {
			eprintln!("Error: {:#}", e);
			ExitCode::FAILURE
		}
	}
}
