//! Runtime configuration.
//!
//! Nothing here is required: every field has a default and can be
//! overridden through the environment. The config record is passed at
//! construction; no component reads the environment on its own.

use std::env;
use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;

/// Core runtime configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Log filter used when `RUST_LOG` is unset (e.g. "info",
    /// "astral_core=debug").
    pub log_level: String,
    /// Maximum concurrent in-flight tasks per constellation.
    pub max_parallel: usize,
    /// Default per-task timeout in seconds.
    pub task_timeout_secs: u64,
    /// Synchronizer gate timeout in seconds.
    pub sync_timeout_secs: u64,
}

impl CoreConfig {
    pub const DEFAULT_LOG_LEVEL: &str = "info";
    pub const DEFAULT_MAX_PARALLEL: usize = 10;
    pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 1000;
    pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;

    /// Build a config from the environment, falling back to defaults.
    ///
    /// Variables: `ASTRAL_LOG_LEVEL`, `ASTRAL_MAX_PARALLEL`,
    /// `ASTRAL_TASK_TIMEOUT_SECS`, `ASTRAL_SYNC_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        Self {
            log_level: env::var("ASTRAL_LOG_LEVEL")
                .unwrap_or_else(|_| Self::DEFAULT_LOG_LEVEL.to_owned()),
            max_parallel: env_parse("ASTRAL_MAX_PARALLEL", Self::DEFAULT_MAX_PARALLEL),
            task_timeout_secs: env_parse(
                "ASTRAL_TASK_TIMEOUT_SECS",
                Self::DEFAULT_TASK_TIMEOUT_SECS,
            ),
            sync_timeout_secs: env_parse(
                "ASTRAL_SYNC_TIMEOUT_SECS",
                Self::DEFAULT_SYNC_TIMEOUT_SECS,
            ),
        }
    }

    /// The orchestrator view of this config.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_parallel: self.max_parallel,
            default_task_timeout: Duration::from_secs(self.task_timeout_secs),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
        }
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: Self::DEFAULT_LOG_LEVEL.to_owned(),
            max_parallel: Self::DEFAULT_MAX_PARALLEL,
            task_timeout_secs: Self::DEFAULT_TASK_TIMEOUT_SECS,
            sync_timeout_secs: Self::DEFAULT_SYNC_TIMEOUT_SECS,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(config: &CoreConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
