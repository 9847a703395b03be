//! End-to-end tests that drive the `runf` binary.
//!
//! Tests marked `#[ignore]` need a Linux host that allows unprivileged user
//! namespaces and a root filesystem (busybox or similar) whose path is given
//! in `RUNF_TEST_ROOTFS`. Run them with `cargo test -- --ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;
use std::process::{Command, Output};

fn runf(work_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_runf"))
        .arg("--work-dir")
        .arg(work_dir)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("runf should start")
}

fn test_rootfs() -> String {
    std::env::var("RUNF_TEST_ROOTFS").expect("RUNF_TEST_ROOTFS must point at a root filesystem")
}

fn assert_work_dir_empty(work_dir: &Path) {
    let left: Vec<_> = std::fs::read_dir(work_dir).unwrap().collect();
    assert!(left.is_empty(), "leftover container state: {left:?}");
}

// ── Failures before any process starts ───────────────────────────────

#[test]
fn missing_rootfs_fails_without_leftovers() {
    let tmp = tempfile::tempdir().unwrap();
    let work_dir = tmp.path().join("work");
    let rootfs = tmp.path().join("absent");

    let output = runf(&work_dir, &["--rootfs", rootfs.to_str().unwrap(), "/bin/true"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("runf:"), "{stderr}");
    assert!(!work_dir.exists() || std::fs::read_dir(&work_dir).unwrap().next().is_none());
}

#[test]
fn malformed_env_entry_is_a_usage_error() {
    let tmp = tempfile::tempdir().unwrap();
    let output = runf(tmp.path(), &["--env", "NOEQUALS", "/bin/true"]);
    assert_eq!(output.status.code(), Some(2));
}

#[cfg(target_os = "linux")]
#[test]
fn init_without_sync_socket_exits_with_failure() {
    let output = Command::new(env!("CARGO_BIN_EXE_runf"))
        .arg("init")
        .env_remove("_RUNF_SYNC_FD")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

// ── Running containers ───────────────────────────────────────────────

#[cfg(target_os = "linux")]
#[test]
#[ignore = "needs user namespaces and RUNF_TEST_ROOTFS"]
fn echo_prints_and_exits_zero() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = test_rootfs();

    let output = runf(tmp.path(), &["--rootfs", &rootfs, "/bin/echo", "hi"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, b"hi\n");
    assert_work_dir_empty(tmp.path());
}

#[cfg(target_os = "linux")]
#[test]
#[ignore = "needs user namespaces and RUNF_TEST_ROOTFS"]
fn exit_status_is_propagated() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = test_rootfs();

    let output = runf(tmp.path(), &["--rootfs", &rootfs, "/bin/sh", "-c", "exit 3"]);

    assert_eq!(output.status.code(), Some(3));
    assert_work_dir_empty(tmp.path());
}

#[cfg(target_os = "linux")]
#[test]
#[ignore = "needs user namespaces and RUNF_TEST_ROOTFS"]
fn environment_reaches_the_process() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = test_rootfs();

    let output = runf(
        tmp.path(),
        &[
            "--rootfs",
            &rootfs,
            "--name",
            "envcheck",
            "--env",
            "GREETING=hello",
            "/bin/sh",
            "-c",
            "echo $GREETING $HOSTNAME",
        ],
    );

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, b"hello envcheck\n");
}

#[cfg(target_os = "linux")]
#[test]
#[ignore = "needs user namespaces and RUNF_TEST_ROOTFS"]
fn failed_cleanup_keeps_the_exit_status() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = test_rootfs();
    // a plain directory instead of cgroupfs: attaching leaves a
    // `cgroup.procs` file behind, so removing the leaf fails
    let cgroup_root = tmp.path().join("cgroup");
    let work_dir = tmp.path().join("work");
    std::fs::create_dir(&cgroup_root).unwrap();

    let output = runf(
        &work_dir,
        &["--cgroup-root", cgroup_root.to_str().unwrap(), "--rootfs", &rootfs, "/bin/echo", "hi"],
    );

    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, b"hi\n");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to clean up container"), "{stderr}");
}

#[cfg(target_os = "linux")]
#[test]
#[ignore = "needs user namespaces and RUNF_TEST_ROOTFS"]
fn timeout_kills_the_container() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = test_rootfs();

    let output = runf(tmp.path(), &["--rootfs", &rootfs, "--timeout", "1", "/bin/sleep", "30"]);

    assert_eq!(output.status.code(), Some(128 + 9));
    assert_work_dir_empty(tmp.path());
}

#[cfg(target_os = "linux")]
#[test]
#[ignore = "needs user namespaces and RUNF_TEST_ROOTFS"]
fn unknown_command_fails_at_exec() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = test_rootfs();

    let output = runf(tmp.path(), &["--rootfs", &rootfs, "/no/such/binary"]);

    assert_eq!(output.status.code(), Some(1));
    assert_work_dir_empty(tmp.path());
}
