//! End-to-end driver runs: entry script → clusters → addons → apply engine
//! → rollout records, all against the mock API server.

use std::fs;
use std::sync::Arc;

use amphipod::cloud::CloudConfig;
use amphipod::driver::{Command, Driver, DriverConfig};
use amphipod::loader::deps::DepsRegistry;
use indexmap::IndexMap;
use kube_mock::{MockK8sServer, RunningMockK8sServer};
use serde_json::{json, Value as Json};

struct Fixture {
	// Keeps the mock server's runtime alive for the duration of the test.
	_runtime: tokio::runtime::Runtime,
	server: RunningMockK8sServer,
	dir: tempfile::TempDir,
}

fn setup(entry: &str, addon_source: &str) -> Fixture {
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("test runtime");
	let server = runtime.block_on(MockK8sServer::new().start());

	let dir = tempfile::tempdir().expect("tempdir");
	let kubeconfig_path = dir.path().join("kubeconfig");
	fs::write(
		&kubeconfig_path,
		serde_yaml::to_string(&server.kubeconfig()).expect("kubeconfig yaml"),
	)
	.expect("write kubeconfig");

	let entry = entry.replace("KUBECONFIG", &kubeconfig_path.to_string_lossy());
	fs::write(dir.path().join("main.apd"), entry).expect("write entry");
	fs::write(dir.path().join("app.apd"), addon_source).expect("write addon");

	Fixture {
		_runtime: runtime,
		server,
		dir,
	}
}

fn config(fixture: &Fixture, command: Command) -> DriverConfig {
	DriverConfig {
		entry_file: fixture.dir.path().join("main.apd"),
		command,
		dry_run: false,
		force: false,
		diff: false,
		diff_filters: Vec::new(),
		addon_regex: None,
		no_spin: true,
		namespace: "default".to_string(),
		qps: 0,
		burst: 0,
		secret_token: String::new(),
		cloud: CloudConfig::default(),
		rel_path: None,
		user_ctx: IndexMap::new(),
	}
}

const ENTRY: &str = r#"
def clusters(ctx):
    return [onprem(cluster = "test-cluster", kubeconfig = "KUBECONFIG")]

def addons(ctx):
    return [addon("app", "app.apd", ctx)]
"#;

const ADDON: &str = r#"
def install(ctx):
    kube.put(
        name = "app-config",
        namespace = "default",
        data = [struct(
            apiVersion = "v1",
            kind = "ConfigMap",
            data = {"cluster": ctx.cluster},
        )],
    )

def remove(ctx):
    kube.delete(configmap = "default/app-config")
"#;

#[test]
fn test_install_applies_objects_and_records_rollout() {
	let fixture = setup(ENTRY, ADDON);
	let driver = Driver::new(config(&fixture, Command::Install), Arc::new(DepsRegistry::default()))
		.expect("driver");

	assert!(driver.run().expect("driver run"), "install should succeed");

	// The addon's object landed, with the cluster context flowing through.
	let cm = fixture
		.server
		.stored("/api/v1/namespaces/default/configmaps", "app-config")
		.expect("config map applied");
	assert_eq!(cm.pointer("/data/cluster"), Some(&json!("test-cluster")));
	assert_eq!(
		cm.pointer("/metadata/labels/heritage"),
		Some(&json!("amphipod"))
	);

	// The rollout completed: a live pointer names the rollout record, which
	// links the addon run.
	let live = fixture
		.server
		.stored("/api/v1/namespaces/default/configmaps", "rollout-live")
		.expect("live rollout pointer");
	let rollout_id = live
		.pointer("/data/rollout")
		.and_then(Json::as_str)
		.expect("live pointer names a rollout")
		.to_string();

	let rollout = fixture
		.server
		.stored("/api/v1/namespaces/default/configmaps", &rollout_id)
		.expect("rollout record");
	let run_name = rollout
		.pointer("/data/app")
		.and_then(Json::as_str)
		.expect("rollout links the app run")
		.to_string();

	let run = fixture
		.server
		.stored("/api/v1/namespaces/default/configmaps", &run_name)
		.expect("run record");
	assert_eq!(run.pointer("/data/addon"), Some(&json!("app")));
	let modules = run.pointer("/data/modules").and_then(Json::as_str).unwrap();
	assert!(modules.contains("app.apd"), "run snapshot lists the addon module");
}

#[test]
fn test_remove_deletes_objects() {
	let fixture = setup(ENTRY, ADDON);

	let install = Driver::new(
		config(&fixture, Command::Install),
		Arc::new(DepsRegistry::default()),
	)
	.expect("driver");
	assert!(install.run().expect("install run"));
	assert!(fixture
		.server
		.stored("/api/v1/namespaces/default/configmaps", "app-config")
		.is_some());

	let remove = Driver::new(
		config(&fixture, Command::Remove),
		Arc::new(DepsRegistry::default()),
	)
	.expect("driver");
	assert!(remove.run().expect("remove run"));
	assert!(fixture
		.server
		.stored("/api/v1/namespaces/default/configmaps", "app-config")
		.is_none());
}

#[test]
fn test_dry_run_install_mutates_nothing() {
	let fixture = setup(ENTRY, ADDON);
	let mut cfg = config(&fixture, Command::Install);
	cfg.dry_run = true;

	let driver = Driver::new(cfg, Arc::new(DepsRegistry::default())).expect("driver");
	assert!(driver.run().expect("driver run"));

	assert!(fixture
		.server
		.stored("/api/v1/namespaces/default/configmaps", "app-config")
		.is_none());
	assert!(fixture
		.server
		.stored("/api/v1/namespaces/default/configmaps", "rollout-live")
		.is_none());
}

#[test]
fn test_addon_regex_filter() {
	let fixture = setup(ENTRY, ADDON);
	let mut cfg = config(&fixture, Command::Install);
	cfg.addon_regex = Some(regex::Regex::new("^nomatch$").unwrap());

	let driver = Driver::new(cfg, Arc::new(DepsRegistry::default())).expect("driver");
	// No addon matches: the cluster fails but the run itself reports the
	// failure through the exit status.
	assert!(!driver.run().expect("driver run"));
}

#[test]
fn test_failing_addon_surfaces_as_cluster_failure() {
	let failing_addon = r#"
def install(ctx):
    error("install exploded")

def remove(ctx):
    pass
"#;
	let fixture = setup(ENTRY, failing_addon);
	let driver = Driver::new(config(&fixture, Command::Install), Arc::new(DepsRegistry::default()))
		.expect("driver");

	assert!(!driver.run().expect("driver run"), "failure must surface");
	// The failed rollout is never promoted to live.
	assert!(fixture
		.server
		.stored("/api/v1/namespaces/default/configmaps", "rollout-live")
		.is_none());
}
