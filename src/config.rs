//! Configuration types.
//!
//! Everything is read from `PIPELINE_*` environment variables with defaults.
//! Unparsable values are errors rather than silently defaulted.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::tasks::PathAliases;
use crate::tasks::paths::load_aliases;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listen address.
    pub bind: SocketAddr,
    /// libSQL database file shared by the state store and the queue.
    pub db_path: PathBuf,
    /// Origins allowed by CORS.
    pub cors_origins: Vec<String>,
    pub executor: ExecutorConfig,
    pub interrupt: InterruptConfig,
    pub retention: RetentionConfig,
    pub pool: WorkerPoolConfig,
}

/// How the worker launches pipelines.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Interpreter or executable started for every run.
    pub program: String,
    /// First argument: the pipeline launcher script.
    pub launcher: String,
    /// Child working directory, and the base for relative paths.
    pub workdir: PathBuf,
    /// Directory holding `<task_id>.log` run logs.
    pub logs_dir: PathBuf,
    /// Aliases applied to config references.
    pub path_aliases: PathAliases,
    /// SIGTERM → SIGKILL timeout when tearing down a child after a fault.
    pub cleanup_term_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            launcher: DEFAULT_LAUNCHER.to_string(),
            workdir: PathBuf::from("."),
            logs_dir: PathBuf::from("./logs"),
            path_aliases: PathAliases::new(),
            cleanup_term_timeout: Duration::from_secs(10),
        }
    }
}

/// Interrupt escalation timings.
#[derive(Debug, Clone)]
pub struct InterruptConfig {
    /// How long a process gets to exit after SIGINT.
    pub grace_period: Duration,
    /// Liveness poll interval while waiting.
    pub poll_interval: Duration,
    /// Wait after SIGKILL before the final liveness check.
    pub kill_wait: Duration,
    /// Command-line fragment identifying pipeline processes in the process table.
    pub signature: String,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(8),
            poll_interval: Duration::from_millis(300),
            kill_wait: Duration::from_secs(2),
            signature: DEFAULT_LAUNCHER.to_string(),
        }
    }
}

impl InterruptConfig {
    /// Upper bound on one escalation plus the store writes that follow it.
    /// The interrupt marker lives this long.
    pub fn marker_ttl(&self) -> Duration {
        self.grace_period + self.kill_wait + 2 * self.poll_interval + Duration::from_secs(1)
    }
}

/// Time-to-live for each record kind.
#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    pub status: Duration,
    pub progress: Duration,
    pub process_handle: Duration,
    pub parameters: Duration,
    pub output_location: Duration,
    /// How often expired keys and finished queue entries are purged.
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            status: Duration::from_secs(7 * DAY),
            progress: Duration::from_secs(4 * DAY),
            process_handle: Duration::from_secs(24 * HOUR),
            parameters: Duration::from_secs(7 * DAY),
            output_location: Duration::from_secs(7 * DAY),
            sweep_interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Concurrent worker loops, each running one task at a time.
    pub workers: usize,
    /// Sleep between queue polls when there is nothing to do.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_millis(500),
        }
    }
}

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;
const DEFAULT_LAUNCHER: &str = "run_pipeline.py";
const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_DB_PATH: &str = "./data/pipeline-orchestrator.db";
const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:5173",
    "http://127.0.0.1:5173",
];

impl ServiceConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_raw = var("PIPELINE_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind_raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: "PIPELINE_BIND".to_string(),
            message: format!("{bind_raw}: {e}"),
        })?;

        let db_path = PathBuf::from(
            var("PIPELINE_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
        );

        let cors_origins = match var("PIPELINE_CORS_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
        };

        let workers: usize = parse_or(&var, "PIPELINE_WORKERS", 1)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let pool = WorkerPoolConfig {
            workers,
            poll_interval: Duration::from_millis(parse_or(&var, "PIPELINE_POLL_INTERVAL_MS", 500)?),
        };

        let launcher = var("PIPELINE_LAUNCHER").unwrap_or_else(|| DEFAULT_LAUNCHER.to_string());
        let signature = var("PIPELINE_SIGNATURE").unwrap_or_else(|| launcher_signature(&launcher));

        let path_aliases = match var("PIPELINE_SUPER_CONFIG") {
            Some(path) => load_aliases(Path::new(&path)).map_err(|e| {
                ConfigError::ParseError(format!("PIPELINE_SUPER_CONFIG ({path}): {e}"))
            })?,
            None => PathAliases::new(),
        };

        let executor = ExecutorConfig {
            program: var("PIPELINE_PROGRAM").unwrap_or_else(|| "python3".to_string()),
            launcher,
            workdir: PathBuf::from(var("PIPELINE_WORKDIR").unwrap_or_else(|| ".".to_string())),
            logs_dir: PathBuf::from(var("PIPELINE_LOGS_DIR").unwrap_or_else(|| "./logs".to_string())),
            path_aliases,
            cleanup_term_timeout: Duration::from_secs(parse_or(
                &var,
                "PIPELINE_CLEANUP_TERM_SECS",
                10,
            )?),
        };

        let interrupt = InterruptConfig {
            grace_period: Duration::from_secs(parse_or(&var, "PIPELINE_GRACE_SECS", 8)?),
            poll_interval: Duration::from_millis(parse_or(&var, "PIPELINE_POLL_MS", 300)?),
            kill_wait: Duration::from_secs(parse_or(&var, "PIPELINE_KILL_WAIT_SECS", 2)?),
            signature,
        };
        if interrupt.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_POLL_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            bind,
            db_path,
            cors_origins,
            executor,
            interrupt,
            retention: RetentionConfig::default(),
            pool,
        })
    }
}

/// Parse an optional numeric variable, falling back to `default` when unset.
fn parse_or<F, T>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw}: {e}"),
        }),
        None => Ok(default),
    }
}

/// The launcher's file name, which appears in every pipeline command line.
fn launcher_signature(launcher: &str) -> String {
    Path::new(launcher)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(launcher)
        .to_string()
}
