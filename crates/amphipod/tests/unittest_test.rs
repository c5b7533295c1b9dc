//! The unit-test driver end to end: fake kube and secret capabilities,
//! `assert`, and per-file reporting.

use std::fs;

use amphipod::unittest::run_unit_tests;

fn run(dir: &std::path::Path) -> (bool, String, String) {
	let mut out = Vec::new();
	let mut err = Vec::new();
	let status = run_unit_tests(
		&format!("{}/...", dir.display()),
		&mut out,
		&mut err,
	)
	.expect("test driver");
	(
		status,
		String::from_utf8(out).unwrap(),
		String::from_utf8(err).unwrap(),
	)
}

#[test]
fn test_fake_kube_round_trip() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(
		dir.path().join("kube_test.apd"),
		r#"
def test_put_get_delete(t):
    kube.put(
        name = "cm",
        namespace = "default",
        data = [struct(
            apiVersion = "v1",
            kind = "ConfigMap",
            data = {"greeting": "hello"},
        )],
    )
    assert(kube.exists(configmap = "default/cm"))

    obj = kube.get(configmap = "default/cm", json = True)
    assert(obj["data"]["greeting"] == "hello", "unexpected data")

    kube.delete(configmap = "default/cm")
    assert(not kube.exists(configmap = "default/cm"))
"#,
	)
	.unwrap();

	let (status, out, err) = run(dir.path());
	assert!(status, "stdout: {out}\nstderr: {err}");
	assert!(out.contains("ok\t"), "{out}");
}

#[test]
fn test_fake_secrets_round_trip() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(
		dir.path().join("secrets_test.apd"),
		r#"
def test_secret_lifecycle(t):
    assert(not secrets.exist("teams/app"))
    secrets.write("teams/app", password = "hunter2")
    assert(secrets.exist("teams/app"))
    assert(secrets.read("teams/app")["password"] == "hunter2")
"#,
	)
	.unwrap();

	let (status, out, err) = run(dir.path());
	assert!(status, "stdout: {out}\nstderr: {err}");
}

#[test]
fn test_assertion_failure_carries_message() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(
		dir.path().join("fail_test.apd"),
		r#"
def test_broken(t):
    assert(1 == 2, "expected equality")
"#,
	)
	.unwrap();

	let (status, out, _err) = run(dir.path());
	assert!(!status);
	assert!(out.contains("FAIL"), "{out}");
	assert!(out.contains("expected equality"), "{out}");
}

#[test]
fn test_fresh_fakes_per_file() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(
		dir.path().join("a_test.apd"),
		r#"
def test_writes_state(t):
    kube.put(
        name = "shared",
        namespace = "default",
        data = [struct(apiVersion = "v1", kind = "ConfigMap")],
    )
    secrets.write("leak", value = "x")
"#,
	)
	.unwrap();
	fs::write(
		dir.path().join("b_test.apd"),
		r#"
def test_sees_clean_state(t):
    assert(not kube.exists(configmap = "default/shared"))
    assert(not secrets.exist("leak"))
"#,
	)
	.unwrap();

	let (status, out, err) = run(dir.path());
	assert!(status, "stdout: {out}\nstderr: {err}");
}

#[test]
fn test_no_tests_found() {
	let dir = tempfile::tempdir().unwrap();
	let (status, out, _err) = run(dir.path());
	assert!(status);
	assert!(out.contains("No tests found."), "{out}");
}
