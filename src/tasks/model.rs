//! Task identifiers, job descriptions and the records kept per task.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::params::ParamMap;

/// Free-form details attached to statuses.
pub type Details = serde_json::Map<String, serde_json::Value>;

/// Opaque task identifier, minted at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Mint a fresh, globally unique id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is safe to embed in a file name.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a client submits: which pipeline to run and how to configure it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Pipeline target identifier (passed through to the launcher).
    #[serde(alias = "node_path")]
    pub target: String,
    /// Optional config reference, possibly an alias.
    #[serde(default, alias = "config_path")]
    pub config: Option<String>,
    /// Optional parameter overrides.
    #[serde(default)]
    pub parameters: Option<ParamMap>,
}

impl JobSpec {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            config: None,
            parameters: None,
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn with_parameters(mut self, parameters: ParamMap) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// Lifecycle status as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Revoked,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Revoked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Revoked => "REVOKED",
        };
        f.write_str(s)
    }
}

/// The subset of statuses a `StatusRecord` may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Revoked,
}

impl From<TerminalStatus> for TaskStatus {
    fn from(s: TerminalStatus) -> Self {
        match s {
            TerminalStatus::Completed => TaskStatus::Completed,
            TerminalStatus::Failed => TaskStatus::Failed,
            TerminalStatus::Revoked => TaskStatus::Revoked,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        TaskStatus::from(*self).fmt(f)
    }
}

/// Terminal outcome of a task. Once written it is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: TerminalStatus,
    pub message: String,
    #[serde(default)]
    pub details: Details,
    pub timestamp: DateTime<Utc>,
}

impl StatusRecord {
    pub fn new(status: TerminalStatus, message: impl Into<String>, details: Details) -> Self {
        Self {
            status,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::new(TerminalStatus::Completed, message, Details::new())
    }

    pub fn failed(message: impl Into<String>, details: Details) -> Self {
        Self::new(TerminalStatus::Failed, message, details)
    }

    pub fn revoked(message: impl Into<String>, details: Details) -> Self {
        Self::new(TerminalStatus::Revoked, message, details)
    }
}

/// Liveness plus fractional progress, written by the running pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub progress: f64,
    pub message: String,
}

/// How a running process was stopped by an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TerminationMethod {
    /// Exited within the grace period after SIGINT.
    #[serde(rename = "SIGINT")]
    Sigint,
    /// Survived SIGINT, gone after SIGKILL.
    #[serde(rename = "SIGKILL")]
    Sigkill,
    /// Still alive after SIGKILL.
    #[serde(rename = "SIGKILL_FAILED")]
    SigkillFailed,
}

impl TerminationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sigint => "SIGINT",
            Self::Sigkill => "SIGKILL",
            Self::SigkillFailed => "SIGKILL_FAILED",
        }
    }

    /// Tag recorded when the process was found by the process-table scan.
    pub fn fallback_tag(&self) -> String {
        format!("{}_FALLBACK", self.as_str())
    }
}

impl fmt::Display for TerminationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved view of a task returned by `GetStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Details>,
}

/// Build a `Details` map from `(key, value)` pairs.
pub fn details<I, K>(pairs: I) -> Details
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_path_safe() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert!(a.is_path_safe());
    }

    #[test]
    fn path_unsafe_ids_rejected() {
        assert!(!TaskId::from("../etc/passwd").is_path_safe());
        assert!(!TaskId::from("").is_path_safe());
        assert!(!TaskId::from("a/b").is_path_safe());
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&TaskStatus::Revoked).unwrap();
        assert_eq!(json, "\"REVOKED\"");
        let parsed: TerminalStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(parsed, TerminalStatus::Failed);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Revoked.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn termination_method_tags() {
        assert_eq!(
            serde_json::to_string(&TerminationMethod::SigkillFailed).unwrap(),
            "\"SIGKILL_FAILED\""
        );
        assert_eq!(TerminationMethod::Sigint.fallback_tag(), "SIGINT_FALLBACK");
        assert!(TerminationMethod::Sigint < TerminationMethod::Sigkill);
        assert!(TerminationMethod::Sigkill < TerminationMethod::SigkillFailed);
    }

    #[test]
    fn job_spec_accepts_legacy_field_names() {
        let job: JobSpec =
            serde_json::from_str(r#"{"node_path": "demo", "config_path": "cfg.yaml"}"#).unwrap();
        assert_eq!(job.target, "demo");
        assert_eq!(job.config.as_deref(), Some("cfg.yaml"));
        assert!(job.parameters.is_none());
    }

    #[test]
    fn status_record_round_trips_with_details() {
        let record = StatusRecord::failed(
            "exit 1",
            details([("exit_code", serde_json::json!(1))]),
        );
        let json = serde_json::to_string(&record).unwrap();
        let parsed: StatusRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, TerminalStatus::Failed);
        assert_eq!(parsed.details["exit_code"], 1);
    }
}
