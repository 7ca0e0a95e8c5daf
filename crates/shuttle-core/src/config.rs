//! Runtime configuration, loaded from TOML with environment overrides.
//!
//! ```toml
//! [scheduler]
//! worker_threads = 8
//! failure_policy = "release"
//! dispatch = "market"
//!
//! [logging]
//! filter = "shuttle_core=debug,info"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::DEFAULT_PROGRESS_RETENTION;
use crate::error::ShuttleError;
use crate::ledger::{FailurePolicy, LedgerOptions};

/// Where ready jobs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Bounded in-process pool owned by the manager.
    #[default]
    Local,

    /// Submit to a job market; external workers execute.
    Market,
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(DispatchMode::Local),
            "market" => Ok(DispatchMode::Market),
            other => Err(format!("unknown dispatch mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Local pool size. Also caps jobs in flight in local mode.
    pub worker_threads: usize,

    /// Bound of the manager command channel.
    pub command_capacity: usize,

    /// Buffer of the event broadcast channel; slow subscribers lag past it.
    pub event_capacity: usize,

    /// Finished jobs whose terminal progress is kept; older ones are dropped.
    pub progress_retention: usize,

    pub failure_policy: FailurePolicy,
    pub strict_dependencies: bool,
    pub reject_cycles: bool,
    pub dispatch: DispatchMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            command_capacity: 1024,
            event_capacity: 1024,
            progress_retention: DEFAULT_PROGRESS_RETENTION,
            failure_policy: FailurePolicy::Block,
            strict_dependencies: false,
            reject_cycles: true,
            dispatch: DispatchMode::Local,
        }
    }
}

impl SchedulerConfig {
    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            failure_policy: self.failure_policy,
            strict_dependencies: self.strict_dependencies,
            reject_cycles: self.reject_cycles,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub command_capacity: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub scheduler: SchedulerConfig,
    pub market: MarketConfig,
    pub logging: LoggingConfig,
}

impl ShuttleConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ShuttleError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ShuttleError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `SHUTTLE_WORKER_THREADS` -> `scheduler.worker_threads`
    /// - `SHUTTLE_COMMAND_CAPACITY` -> `scheduler.command_capacity`
    /// - `SHUTTLE_PROGRESS_RETENTION` -> `scheduler.progress_retention`
    /// - `SHUTTLE_FAILURE_POLICY` -> `scheduler.failure_policy`
    /// - `SHUTTLE_STRICT_DEPENDENCIES` -> `scheduler.strict_dependencies`
    /// - `SHUTTLE_LOG` -> `logging.filter`
    pub fn apply_env_overrides(&mut self) -> Result<(), ShuttleError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ShuttleError> {
        if let Some(v) = lookup("SHUTTLE_WORKER_THREADS") {
            self.scheduler.worker_threads = parse_env("SHUTTLE_WORKER_THREADS", &v)?;
        }
        if let Some(v) = lookup("SHUTTLE_COMMAND_CAPACITY") {
            self.scheduler.command_capacity = parse_env("SHUTTLE_COMMAND_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("SHUTTLE_PROGRESS_RETENTION") {
            self.scheduler.progress_retention = parse_env("SHUTTLE_PROGRESS_RETENTION", &v)?;
        }
        if let Some(v) = lookup("SHUTTLE_FAILURE_POLICY") {
            self.scheduler.failure_policy = v
                .parse()
                .map_err(|e: String| ShuttleError::Config(format!("SHUTTLE_FAILURE_POLICY: {e}")))?;
        }
        if let Some(v) = lookup("SHUTTLE_STRICT_DEPENDENCIES") {
            self.scheduler.strict_dependencies = parse_env("SHUTTLE_STRICT_DEPENDENCIES", &v)?;
        }
        if let Some(v) = lookup("SHUTTLE_LOG") {
            self.logging.filter = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ShuttleError> {
        let s = &self.scheduler;
        for (name, value) in [
            ("scheduler.worker_threads", s.worker_threads),
            ("scheduler.command_capacity", s.command_capacity),
            ("scheduler.event_capacity", s.event_capacity),
            ("scheduler.progress_retention", s.progress_retention),
            ("market.command_capacity", self.market.command_capacity),
        ] {
            if value == 0 {
                return Err(ShuttleError::Config(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ShuttleError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ShuttleError::Config(format!("{key}={value:?}: {e}")))
}
