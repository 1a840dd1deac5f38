//! Integration tests for configuration layering and the audit log.

mod common;

use common::TestEnv;
use predicates::prelude::*;
use std::fs;

#[test]
fn test_config_show_defaults() {
    let env = TestEnv::new();
    let json = env.json(&["config", "show"]);
    assert_eq!(json["complexity-threshold"]["value"], 0.7);
    assert_eq!(json["complexity-threshold"]["source"], "default");
    assert_eq!(json["max-iterations"]["value"], 3);
    assert_eq!(json["audit-log"]["value"], true);
}

#[test]
fn test_config_layers() {
    let env = TestEnv::init();
    fs::write(
        env.config_path().join("config.kdl"),
        "complexity-threshold 0.5\nconflict-retries 1\n",
    )
    .unwrap();
    env.json(&["config", "set", "max-iterations", "5"]);

    let json = env.json(&["config", "show"]);
    assert_eq!(json["complexity-threshold"]["value"], 0.5);
    assert_eq!(json["complexity-threshold"]["source"], "system");
    assert_eq!(json["conflict-retries"]["source"], "system");
    assert_eq!(json["max-iterations"]["value"], 5);
    assert_eq!(json["max-iterations"]["source"], "workspace");

    let json: serde_json::Value = serde_json::from_slice(
        &env.duet()
            .args(["config", "show", "--timeout-ms", "250"])
            .env("DUET_MAX_ITERATIONS", "2")
            .assert()
            .success()
            .get_output()
            .stdout,
    )
    .unwrap();
    assert_eq!(json["max-iterations"]["value"], 2);
    assert_eq!(json["max-iterations"]["source"], "env:DUET_MAX_ITERATIONS");
    assert_eq!(json["generation-timeout-ms"]["source"], "cli");

    let project = env.json(&["project", "create", "Shop", "-d", "Sell things"]);
    assert_eq!(project["complexity_threshold"], 0.5);
    assert_eq!(project["max_iterations"], 5);
}

#[test]
fn test_config_set_rejects_bad_values() {
    let env = TestEnv::init();
    let err = env.error(&["config", "set", "complexity-threshold", "2"]);
    assert_eq!(err["kind"], "ValidationError");
    let err = env.error(&["config", "set", "colour", "blue"]);
    assert_eq!(err["kind"], "ValidationError");
}

#[test]
fn test_invalid_env_value_fails() {
    let env = TestEnv::init();
    env.duet()
        .args(["project", "list"])
        .env("DUET_COMPLEXITY_THRESHOLD", "lots")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DUET_COMPLEXITY_THRESHOLD"));
}

#[test]
fn test_audit_log_records_changes_and_commands() {
    let env = TestEnv::init();
    let project = env.create_project("Shop", &[]);
    assert!(env.data_path().join("audit.log").exists());

    let log = env.json(&["log", &project]);
    let records = log["records"].as_array().unwrap();
    assert!(records
        .iter()
        .any(|r| r["type"] == "change" && r["entity"] == "project" && r["change"] == "created"));
    let create = records
        .iter()
        .find(|r| r["type"] == "command" && r["command"] == "project create")
        .unwrap();
    assert!(create["entities"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e == project.as_str()));

    let limited = env.json(&["log", "--limit", "1"]);
    assert_eq!(limited["count"], 1);
}

#[test]
fn test_no_audit_log_flag() {
    let env = TestEnv::init();
    let audit_path = env.data_path().join("audit.log");
    let before = fs::read_to_string(&audit_path).unwrap_or_default();

    env.json(&["project", "create", "Shop", "-d", "Sell things", "--no-audit-log"]);
    assert_eq!(fs::read_to_string(&audit_path).unwrap_or_default(), before);

    let err = env.error(&["log", "--no-audit-log"]);
    assert_eq!(err["kind"], "ValidationError");
}

#[test]
fn test_missing_workspace_is_rejected() {
    let env = TestEnv::init();
    let missing = env.workspace_path().join("nope");
    let err = env.error(&["project", "list", "-C", missing.to_str().unwrap()]);
    assert_eq!(err["kind"], "ValidationError");
}
