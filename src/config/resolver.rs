//! Precedence resolution for engine settings.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (passed at runtime)
//! 2. Environment variables (`DUET_COMPLEXITY_THRESHOLD`, `DUET_MAX_ITERATIONS`,
//!    `DUET_GENERATION_TIMEOUT_MS`)
//! 3. Workspace config.kdl (`<data-dir>/config.kdl`)
//! 4. System config.kdl (`~/.config/duet/config.kdl`)
//! 5. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;

use super::schema::{system_config_path, workspace_config_path, DuetConfig};
use super::EngineConfig;
use crate::audit_log::expand_home;
use crate::models::{DEFAULT_COMPLEXITY_THRESHOLD, DEFAULT_MAX_ITERATIONS};
use crate::{Error, Result};

/// Environment override for the default complexity threshold.
pub const THRESHOLD_ENV: &str = "DUET_COMPLEXITY_THRESHOLD";
/// Environment override for the default revision budget.
pub const MAX_ITERATIONS_ENV: &str = "DUET_MAX_ITERATIONS";
/// Environment override for the generation timeout.
pub const GENERATION_TIMEOUT_ENV: &str = "DUET_GENERATION_TIMEOUT_MS";

pub const DEFAULT_OPTIMIZATION_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_GENERATION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;
pub const AUDIT_LOG_FILE: &str = "audit.log";

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from environment variable
    EnvVar(String),
    /// Value from the workspace config.kdl
    Workspace,
    /// Value from the system config.kdl
    System,
    /// Value from CLI flag
    CliFlag,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::Workspace => write!(f, "workspace"),
            ValueSource::System => write!(f, "system"),
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    /// Create a new resolved value.
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Fully resolved settings with source tracking.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub complexity_threshold: Resolved<f64>,
    pub max_iterations: Resolved<u32>,
    pub optimization_max_iterations: Resolved<u32>,
    pub generation_timeout_ms: Resolved<u64>,
    pub conflict_retries: Resolved<u32>,
    pub audit_log: Resolved<bool>,
    pub audit_log_path: Resolved<PathBuf>,
}

impl ResolvedConfig {
    /// Built-in defaults for a data directory.
    pub fn defaults(data_dir: &Path) -> Self {
        Self {
            complexity_threshold: Resolved::new(DEFAULT_COMPLEXITY_THRESHOLD, ValueSource::Default),
            max_iterations: Resolved::new(DEFAULT_MAX_ITERATIONS, ValueSource::Default),
            optimization_max_iterations: Resolved::new(
                DEFAULT_OPTIMIZATION_MAX_ITERATIONS,
                ValueSource::Default,
            ),
            generation_timeout_ms: Resolved::new(
                DEFAULT_GENERATION_TIMEOUT_MS,
                ValueSource::Default,
            ),
            conflict_retries: Resolved::new(DEFAULT_CONFLICT_RETRIES, ValueSource::Default),
            audit_log: Resolved::new(true, ValueSource::Default),
            audit_log_path: Resolved::new(data_dir.join(AUDIT_LOG_FILE), ValueSource::Default),
        }
    }

    /// Settings the engine runs with.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_complexity_threshold: self.complexity_threshold.value,
            default_max_iterations: self.max_iterations.value,
            optimization_max_iterations: self.optimization_max_iterations.value,
            generation_timeout: Duration::from_millis(self.generation_timeout_ms.value),
            conflict_retries: self.conflict_retries.value,
        }
    }

    /// Audit log file, when auditing is enabled.
    pub fn audit_log_file(&self) -> Option<&Path> {
        self.audit_log
            .value
            .then_some(self.audit_log_path.value.as_path())
    }

    /// Key/value/source listing used by `config show`.
    pub fn to_json(&self) -> serde_json::Value {
        fn entry<T: serde::Serialize>(resolved: &Resolved<T>) -> serde_json::Value {
            json!({ "value": resolved.value, "source": resolved.source.to_string() })
        }
        json!({
            "complexity-threshold": entry(&self.complexity_threshold),
            "max-iterations": entry(&self.max_iterations),
            "optimization-max-iterations": entry(&self.optimization_max_iterations),
            "generation-timeout-ms": entry(&self.generation_timeout_ms),
            "conflict-retries": entry(&self.conflict_retries),
            "audit-log": entry(&self.audit_log),
            "audit-log-path": entry(&self.audit_log_path),
        })
    }
}

/// CLI overrides for configuration resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub complexity_threshold: Option<f64>,
    pub max_iterations: Option<u32>,
    pub generation_timeout_ms: Option<u64>,
    pub audit_log: Option<bool>,
}

impl ConfigOverrides {
    /// Create empty overrides.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_complexity_threshold(mut self, threshold: f64) -> Self {
        self.complexity_threshold = Some(threshold);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_generation_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.generation_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_audit_log(mut self, enabled: bool) -> Self {
        self.audit_log = Some(enabled);
        self
    }

    fn validate(&self) -> Result<()> {
        DuetConfig {
            complexity_threshold: self.complexity_threshold,
            max_iterations: self.max_iterations,
            generation_timeout_ms: self.generation_timeout_ms,
            ..DuetConfig::default()
        }
        .validate()
    }
}

/// Values taken from the environment, each tagged with its variable.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub complexity_threshold: Option<f64>,
    pub max_iterations: Option<u32>,
    pub generation_timeout_ms: Option<u64>,
}

impl EnvOverrides {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides through `lookup`. Unparsable or out-of-range values
    /// are rejected with the variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let overrides = Self {
            complexity_threshold: parse_env(&lookup, THRESHOLD_ENV)?,
            max_iterations: parse_env(&lookup, MAX_ITERATIONS_ENV)?,
            generation_timeout_ms: parse_env(&lookup, GENERATION_TIMEOUT_ENV)?,
        };
        DuetConfig {
            complexity_threshold: overrides.complexity_threshold,
            max_iterations: overrides.max_iterations,
            generation_timeout_ms: overrides.generation_timeout_ms,
            ..DuetConfig::default()
        }
        .validate()
        .map_err(|e| Error::Validation(format!("{} (from environment)", e)))?;
        Ok(overrides)
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Validation(format!("{} has an invalid value: {}", name, raw))),
        _ => Ok(None),
    }
}

/// Resolve settings for a data directory, reading both config files and the
/// process environment.
pub fn resolve_config(data_dir: &Path, overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
    let system = match system_config_path() {
        Some(path) => DuetConfig::load(&path)?,
        None => DuetConfig::new(),
    };
    let workspace = DuetConfig::load(&workspace_config_path(data_dir))?;
    let env = EnvOverrides::from_env()?;
    resolve_layers(data_dir, &system, &workspace, &env, overrides)
}

/// Resolve settings from already loaded layers.
pub fn resolve_layers(
    data_dir: &Path,
    system: &DuetConfig,
    workspace: &DuetConfig,
    env: &EnvOverrides,
    overrides: &ConfigOverrides,
) -> Result<ResolvedConfig> {
    overrides.validate()?;
    let mut result = ResolvedConfig::defaults(data_dir);

    // Resolve complexity_threshold
    if let Some(threshold) = overrides.complexity_threshold {
        result.complexity_threshold = Resolved::new(threshold, ValueSource::CliFlag);
    } else if let Some(threshold) = env.complexity_threshold {
        result.complexity_threshold =
            Resolved::new(threshold, ValueSource::EnvVar(THRESHOLD_ENV.to_string()));
    } else if let Some(threshold) = workspace.complexity_threshold {
        result.complexity_threshold = Resolved::new(threshold, ValueSource::Workspace);
    } else if let Some(threshold) = system.complexity_threshold {
        result.complexity_threshold = Resolved::new(threshold, ValueSource::System);
    }

    // Resolve max_iterations
    if let Some(n) = overrides.max_iterations {
        result.max_iterations = Resolved::new(n, ValueSource::CliFlag);
    } else if let Some(n) = env.max_iterations {
        result.max_iterations = Resolved::new(n, ValueSource::EnvVar(MAX_ITERATIONS_ENV.to_string()));
    } else if let Some(n) = workspace.max_iterations {
        result.max_iterations = Resolved::new(n, ValueSource::Workspace);
    } else if let Some(n) = system.max_iterations {
        result.max_iterations = Resolved::new(n, ValueSource::System);
    }

    // Resolve generation_timeout_ms
    if let Some(ms) = overrides.generation_timeout_ms {
        result.generation_timeout_ms = Resolved::new(ms, ValueSource::CliFlag);
    } else if let Some(ms) = env.generation_timeout_ms {
        result.generation_timeout_ms =
            Resolved::new(ms, ValueSource::EnvVar(GENERATION_TIMEOUT_ENV.to_string()));
    } else if let Some(ms) = workspace.generation_timeout_ms {
        result.generation_timeout_ms = Resolved::new(ms, ValueSource::Workspace);
    } else if let Some(ms) = system.generation_timeout_ms {
        result.generation_timeout_ms = Resolved::new(ms, ValueSource::System);
    }

    // Resolve audit_log
    if let Some(enabled) = overrides.audit_log {
        result.audit_log = Resolved::new(enabled, ValueSource::CliFlag);
    } else if let Some(enabled) = workspace.audit_log {
        result.audit_log = Resolved::new(enabled, ValueSource::Workspace);
    } else if let Some(enabled) = system.audit_log {
        result.audit_log = Resolved::new(enabled, ValueSource::System);
    }

    // File-only settings
    if let Some(n) = workspace.optimization_max_iterations {
        result.optimization_max_iterations = Resolved::new(n, ValueSource::Workspace);
    } else if let Some(n) = system.optimization_max_iterations {
        result.optimization_max_iterations = Resolved::new(n, ValueSource::System);
    }

    if let Some(n) = workspace.conflict_retries {
        result.conflict_retries = Resolved::new(n, ValueSource::Workspace);
    } else if let Some(n) = system.conflict_retries {
        result.conflict_retries = Resolved::new(n, ValueSource::System);
    }

    if let Some(ref path) = workspace.audit_log_path {
        result.audit_log_path = Resolved::new(expand_home(path), ValueSource::Workspace);
    } else if let Some(ref path) = system.audit_log_path {
        result.audit_log_path = Resolved::new(expand_home(path), ValueSource::System);
    }

    Ok(result)
}
