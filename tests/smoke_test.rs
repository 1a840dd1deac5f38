//! Smoke tests for the Duet CLI.
//!
//! These tests verify basic CLI functionality:
//! - `duet --version` outputs version info
//! - `duet --help` outputs help text
//! - `duet` (no args) prints usage and fails

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a Command for the duet binary.
fn duet() -> Command {
    Command::new(env!("CARGO_BIN_EXE_duet"))
}

#[test]
fn test_version_flag() {
    duet()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("duet"))
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_help_flag() {
    duet()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("Commands:"))
        .stdout(predicate::str::contains("collaborate"));
}

#[test]
fn test_help_flag_short() {
    duet()
        .arg("-h")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"));
}

#[test]
fn test_no_args_shows_usage() {
    duet()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_unknown_subcommand_fails() {
    duet().arg("frobnicate").assert().failure();
}
