//! Error types for the pipeline orchestrator.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Parameter error: {0}")]
    Params(#[from] ParamError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// State store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Queue/broker errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue query failed: {0}")]
    Query(String),

    #[error("Queue payload could not be encoded or decoded: {0}")]
    Serialization(String),
}

/// Errors surfaced synchronously by `Submit`.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid job description: {0}")]
    InvalidJob(String),

    #[error("Failed to enqueue task: {0}")]
    Queue(#[from] QueueError),
}

/// Parameter and config resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("Key conflict while flattening parameters: '{0}'")]
    KeyConflict(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Failed to read config file {path}: {reason}")]
    ConfigUnreadable { path: String, reason: String },

    #[error("Invalid config file {path}: {reason}")]
    InvalidConfig { path: String, reason: String },
}

/// Faults inside a worker run. Each one ends the task as FAILED.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Parameter resolution failed: {0}")]
    Resolution(#[from] ParamError),

    #[error("Failed to serialize parameters: {0}")]
    Serialization(String),

    #[error("Failed to spawn pipeline process: {0}")]
    Spawn(String),

    #[error("Spawned process has no pid")]
    MissingPid,

    #[error("Failed waiting for pipeline process {pid}: {reason}")]
    Wait { pid: u32, reason: String },

    #[error("State store error during run: {0}")]
    Store(#[from] StoreError),

    #[error("Cleanup of process {pid} timed out after {timeout:?}")]
    CleanupTimeout { pid: u32, timeout: Duration },
}

/// Errors from sending a signal to an OS process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("No such process: {pid}")]
    NoSuchProcess { pid: u32 },

    #[error("Permission denied signaling process {pid}")]
    PermissionDenied { pid: u32 },

    #[error("Failed to signal process {pid}: {reason}")]
    Other { pid: u32, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
