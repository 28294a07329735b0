//! CLI smoke tests for the `warden` binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn warden(dir: &tempfile::TempDir) -> Command {
    let mut cmd = assert_cmd::cargo_bin_cmd!("warden");
    cmd.current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("WARDEN_CONFIG")
        .env_remove("PORT")
        .env_remove("API_PORT")
        .env_remove("TRAFFIC_CHECK_INTERVAL_SECONDS")
        .env("WARDEN_STORAGE_DIR", dir.path().join("store"))
        .env("WARDEN_STORAGE_KEY", "users.json");
    cmd
}

#[test]
fn help_lists_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    warden(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("render-config"))
        .stdout(predicate::str::contains("tick"));
}

#[test]
fn render_config_without_accounts_emits_placeholder_client() {
    let dir = tempfile::tempdir().unwrap();
    let output = warden(&dir).arg("render-config").output().unwrap();
    assert!(output.status.success());

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let clients = doc["inbounds"][0]["settings"]["clients"].as_array().unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(doc["inbounds"][0]["port"], 8080);
    assert_eq!(doc["inbounds"][1]["protocol"], "dokodemo-door");
}

#[test]
fn render_config_lists_active_stored_accounts() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("store")).unwrap();
    std::fs::write(
        dir.path().join("store").join("users.json"),
        r#"{
            "on":  {"id": "on",  "traffic_limit_gb": 1, "time_limit_days": 30,
                    "created_at": "2024-01-01T00:00:00Z", "traffic_used_bytes": 0, "is_active": true},
            "off": {"id": "off", "traffic_limit_gb": 1, "time_limit_days": 30,
                    "created_at": "2024-01-01T00:00:00Z", "traffic_used_bytes": 0, "is_active": false}
        }"#,
    )
    .unwrap();

    warden(&dir)
        .arg("render-config")
        .env("PORT", "9443")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"email\": \"user_on\""))
        .stdout(predicate::str::contains("user_off").not())
        .stdout(predicate::str::contains("\"port\": 9443"));
}

#[test]
fn malformed_config_fails_with_remediation() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("warden.toml"), "[proxy\nport = 1").unwrap();

    warden(&dir)
        .arg("render-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config"))
        .stderr(predicate::str::contains("TOML"));
}

#[test]
fn malformed_account_document_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("store")).unwrap();
    std::fs::write(dir.path().join("store").join("users.json"), "not json").unwrap();

    warden(&dir)
        .arg("render-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load accounts"));
}

#[test]
fn tick_without_accounts_reports_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let output = warden(&dir).args(["tick", "--force"]).output().unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["outcome"], "unchanged");
    assert_eq!(report["restart_required"], false);
    assert!(report["restart_generation"].is_null());
}

#[test]
fn tick_refuses_to_run_next_to_a_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = daemon.local_addr().unwrap().port();

    warden(&dir)
        .arg("tick")
        .env("API_PORT", port.to_string())
        .assert()
        .failure()
        .stderr(predicate::str::contains("a daemon is listening"));
}
