//! The `status` subcommand end to end: init a config in a scratch directory,
//! then check the printed JSON snapshot.

use std::path::Path;
use std::process::{Command, Output};

fn meshmeter(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_meshmeter"))
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap()
}

#[test]
fn status_reports_config_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    let config = config.to_str().unwrap();

    let init = meshmeter(dir.path(), &["init", "--config", config]);
    assert!(init.status.success(), "init failed: {init:?}");

    let status = meshmeter(dir.path(), &["status", "--config", config]);
    assert!(status.status.success(), "status failed: {status:?}");

    let snapshot: serde_json::Value = serde_json::from_slice(&status.stdout)
        .unwrap_or_else(|e| panic!("status did not print JSON: {e}"));
    assert_eq!(snapshot["node_id"], "random");
    assert_eq!(snapshot["modem_mode"], "serial");
    assert_eq!(snapshot["block_size"], 128);

    // A fresh process has nothing counted yet, but the block itself is part
    // of the snapshot.
    let counters = &snapshot["counters"];
    assert!(counters.is_object(), "snapshot lacks counters: {snapshot}");
    assert_eq!(counters["publish_sent"], 0);
    assert_eq!(counters["chunks_sent"], 0);
}

#[test]
fn status_without_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let status = meshmeter(dir.path(), &["status", "--config", "missing.toml"]);
    assert!(!status.status.success(), "status ran without a config file");
}
