//! Integration tests for xstreamctl
//!
//! Privileged commands run with --dry-run so nothing touches the host.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn xstreamctl() -> Command {
    Command::cargo_bin("xstreamctl").unwrap()
}

/// Config file pointing every writable path into `dir`
fn write_config(dir: &Path) -> PathBuf {
    let config = format!(
        r#"platform = "linux"

[paths]
state_dir = "{state}"
node_store = "{state}/vpn_nodes.json"
core_binary = "{state}/bin/xray"

[proxy]
host = "127.0.0.1"
port = 1081
"#,
        state = dir.join("state").display()
    );
    let path = dir.join("xstream.toml");
    fs::write(&path, config).unwrap();
    path
}

fn with_config(dir: &TempDir) -> Command {
    let config = write_config(dir.path());
    let mut cmd = xstreamctl();
    cmd.arg("--config").arg(config).arg("--dry-run").arg("--platform").arg("linux");
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_command() {
    xstreamctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Control the XStream tunnel"));
}

#[test]
fn test_config_show_reflects_file() {
    let dir = TempDir::new().unwrap();
    with_config(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 1081"))
        .stdout(predicate::str::contains("intercept_routes"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[proxy]\nport = \"not a number\"\n").unwrap();

    xstreamctl()
        .arg("--config")
        .arg(&path)
        .args(["config", "show"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_nodes_merge_and_list() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("nodes.json");
    let first = dir.path().join("first.json");
    let second = dir.path().join("second.json");
    fs::write(&first, r#"[{"name":"jp","host":"1.1.1.1"},{"name":"us","host":"2.2.2.2"}]"#).unwrap();
    fs::write(&second, r#"[{"name":"us","host":"3.3.3.3"},{"name":"sg"}]"#).unwrap();

    with_config(&dir)
        .args(["nodes", "merge"])
        .arg(&first)
        .arg("--store")
        .arg(&store)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"count\": 2"));

    with_config(&dir)
        .args(["nodes", "merge"])
        .arg(&second)
        .arg("--store")
        .arg(&store)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"count\": 3"));

    let output = with_config(&dir)
        .args(["nodes", "list", "--store"])
        .arg(&store)
        .output()
        .unwrap();
    assert!(output.status.success());
    let response: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = response["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["jp", "us", "sg"]);
    assert_eq!(response["data"][1]["host"], "3.3.3.3");
}

#[test]
fn test_nodes_merge_from_stdin() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("nodes.json");

    with_config(&dir)
        .args(["nodes", "merge", "-", "--store"])
        .arg(&store)
        .write_stdin(r#"[{"name":"hk","transport":{"type":"ws"}}]"#)
        .assert()
        .success();

    let saved: serde_json::Value = serde_json::from_str(&fs::read_to_string(&store).unwrap()).unwrap();
    assert_eq!(saved[0]["transport"]["type"], "ws");
}

#[test]
fn test_nameless_node_is_error_response() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("bad.json");
    fs::write(&file, r#"[{"host":"1.1.1.1"}]"#).unwrap();

    with_config(&dir)
        .args(["nodes", "merge"])
        .arg(&file)
        .arg("--store")
        .arg(dir.path().join("nodes.json"))
        .assert()
        .code(1)
        .stdout(predicate::str::contains("ArgumentError"));
}

#[test]
fn test_malformed_json_input_fails() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("bad.json");
    fs::write(&file, "[{").unwrap();

    with_config(&dir)
        .args(["nodes", "merge"])
        .arg(&file)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not valid JSON"));
}

#[test]
fn test_dry_run_tunnel_start_then_stop_in_separate_runs() {
    let dir = TempDir::new().unwrap();

    with_config(&dir)
        .arg("start")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"running\""));

    // each invocation is a fresh process; the state file carries the tunnel over
    with_config(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"running\""));

    with_config(&dir)
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"stopped\""))
        .stderr(predicate::str::contains("[dry-run] ip route del 0.0.0.0/1"))
        .stderr(predicate::str::contains("[dry-run] systemctl stop"));

    with_config(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"stopped\""));
}

#[test]
fn test_stop_without_start_issues_nothing() {
    let dir = TempDir::new().unwrap();
    with_config(&dir)
        .arg("stop")
        .assert()
        .success()
        .stderr(predicate::str::contains("[dry-run]").not());
}

#[test]
fn test_write_config_requires_dest_and_source() {
    let dir = TempDir::new().unwrap();

    with_config(&dir)
        .args(["write-config", "/opt/etc/xray-vpn-node-jp.json"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("DEST=LOCAL_SOURCE"));

    let source = dir.path().join("node.json");
    fs::write(&source, "{}").unwrap();
    with_config(&dir)
        .arg("write-config")
        .arg(format!("/opt/etc/xray-vpn-node-jp.json={}", source.display()))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"written\": 1"));
}

#[test]
fn test_core_status_idle() {
    let dir = TempDir::new().unwrap();
    with_config(&dir)
        .args(["core", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"downloading\": false"));
}
