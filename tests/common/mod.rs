//! Common test utilities for duet integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't pollute
//! the user's `~/.local/share/duet/` or `~/.config/duet/` directories.

#![allow(dead_code)]

use assert_cmd::Command;
pub use tempfile::TempDir;

/// A test environment with isolated data storage.
///
/// Each `TestEnv` creates three temporary directories:
/// - `workspace_dir`: Acts as the working directory
/// - `data_dir`: Holds duet's database (via `DUET_DATA_DIR`)
/// - `config_dir`: Holds the system config.kdl (via `DUET_CONFIG_DIR`)
///
/// The `duet()` method sets these per invocation, making tests parallel-safe.
pub struct TestEnv {
    pub workspace_dir: TempDir,
    pub data_dir: TempDir,
    pub config_dir: TempDir,
}

impl TestEnv {
    /// Create a new test environment with isolated directories.
    pub fn new() -> Self {
        Self {
            workspace_dir: TempDir::new().unwrap(),
            data_dir: TempDir::new().unwrap(),
            config_dir: TempDir::new().unwrap(),
        }
    }

    /// Create a new test environment and initialize the database.
    pub fn init() -> Self {
        let env = Self::new();
        env.duet().arg("init").assert().success();
        env
    }

    /// Get a Command for the duet binary with isolated directories.
    pub fn duet(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_duet"));
        cmd.current_dir(self.workspace_dir.path());
        cmd.env("DUET_DATA_DIR", self.data_dir.path());
        cmd.env("DUET_CONFIG_DIR", self.config_dir.path());
        cmd.env_remove("DUET_WORKSPACE");
        cmd.env_remove("DUET_COMPLEXITY_THRESHOLD");
        cmd.env_remove("DUET_MAX_ITERATIONS");
        cmd.env_remove("DUET_GENERATION_TIMEOUT_MS");
        cmd.env("DUET_LOG", "off");
        cmd
    }

    /// Run a command that must succeed and parse its JSON stdout.
    pub fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.duet().args(args).assert().success().get_output().stdout.clone();
        serde_json::from_slice(&output).unwrap_or_else(|e| {
            panic!(
                "invalid JSON from {:?}: {} ({})",
                args,
                e,
                String::from_utf8_lossy(&output)
            )
        })
    }

    /// Run a command that must fail and parse the JSON error on stderr.
    pub fn error(&self, args: &[&str]) -> serde_json::Value {
        let output = self.duet().args(args).assert().failure().get_output().stderr.clone();
        serde_json::from_slice(&output).unwrap()
    }

    /// Create a project and return its id.
    pub fn create_project(&self, name: &str, extra: &[&str]) -> String {
        let mut args = vec!["project", "create", name, "-d", "A test project"];
        args.extend_from_slice(extra);
        self.json(&args)["id"].as_str().unwrap().to_string()
    }

    /// Define one root task and return its id.
    pub fn define_task(&self, project_id: &str, spec: &str) -> String {
        self.json(&["task", "define", project_id, "--task", spec])["tasks"][0]["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    /// Create a step and return its id.
    pub fn create_step(&self, task_id: &str, title: &str) -> String {
        self.json(&["step", "create", task_id, title])["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    pub fn workspace_path(&self) -> &std::path::Path {
        self.workspace_dir.path()
    }

    pub fn data_path(&self) -> &std::path::Path {
        self.data_dir.path()
    }

    pub fn config_path(&self) -> &std::path::Path {
        self.config_dir.path()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
