//! Configuration for Duet.
//!
//! ## config.kdl
//!
//! Located at:
//! - System: `~/.config/duet/config.kdl` (or `$DUET_CONFIG_DIR/config.kdl`)
//! - Workspace: `<data-dir>/config.kdl`
//!
//! Contains:
//! - `complexity-threshold` - Default promotion threshold for new projects
//! - `max-iterations` - Default revision budget for new projects
//! - `optimization-max-iterations` - Pass cap of the promotion loop
//! - `generation-timeout-ms` - Timeout for each generation call
//! - `conflict-retries` - Retries after a concurrent modification
//! - `audit-log` / `audit-log-path` - JSONL audit trail of change events
//!
//! ## Precedence
//!
//! CLI flag > environment > workspace config > system config > defaults
//!
//! Use the [`resolver`] module for unified precedence resolution.

pub mod resolver;
pub mod schema;

use std::time::Duration;

pub use resolver::{
    ConfigOverrides, EnvOverrides, Resolved, ResolvedConfig, ValueSource, resolve_config,
    resolve_layers,
};
pub use schema::{CONFIG_FILE, DuetConfig, system_config_path, workspace_config_path};

use crate::models::{DEFAULT_COMPLEXITY_THRESHOLD, DEFAULT_MAX_ITERATIONS};
use resolver::{
    DEFAULT_CONFLICT_RETRIES, DEFAULT_GENERATION_TIMEOUT_MS, DEFAULT_OPTIMIZATION_MAX_ITERATIONS,
};

/// Settings the engine runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Threshold given to projects created without one
    pub default_complexity_threshold: f64,
    /// Revision budget given to projects created without one
    pub default_max_iterations: u32,
    /// Pass cap for `run_promotion_optimization` when the caller gives none
    pub optimization_max_iterations: u32,
    /// Upper bound on every generation call
    pub generation_timeout: Duration,
    /// Transparent retries after a concurrent modification
    pub conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_complexity_threshold: DEFAULT_COMPLEXITY_THRESHOLD,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            optimization_max_iterations: DEFAULT_OPTIMIZATION_MAX_ITERATIONS,
            generation_timeout: Duration::from_millis(DEFAULT_GENERATION_TIMEOUT_MS),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }
}
