//! Progress reporting: the narrow interface a running pipeline uses to say
//! how far along it is.
//!
//! Pipelines report either by printing `##progress <fraction> [message]` on
//! stdout or through the HTTP progress endpoint. Both land here. Reporting is
//! best-effort: a store failure is logged and never interrupts the run.

use tracing::{debug, warn};

use crate::store::TaskRecords;
use crate::tasks::{ProgressRecord, TaskId};

/// Stdout marker for progress lines.
pub const PROGRESS_MARKER: &str = "##progress";

/// Message written when a worker picks a task up.
pub const INITIAL_MESSAGE: &str = "Initializing task...";

/// Reports progress for one task.
#[derive(Clone)]
pub struct ProgressReporter {
    records: TaskRecords,
    task_id: TaskId,
}

impl ProgressReporter {
    pub fn new(records: TaskRecords, task_id: TaskId) -> Self {
        Self { records, task_id }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Record progress. The fraction is clamped to `[0, 1]`; a missing message
    /// keeps the previously reported one.
    pub async fn report(&self, progress: f64, message: Option<&str>) {
        let message = match message {
            Some(m) => m.to_string(),
            None => match self.records.progress(&self.task_id).await {
                Ok(Some(previous)) => previous.message,
                _ => String::new(),
            },
        };

        let record = ProgressRecord {
            progress: clamp_progress(progress),
            message,
        };
        match self.records.write_progress(&self.task_id, &record).await {
            Ok(()) => debug!(task_id = %self.task_id, progress = record.progress, "Progress reported"),
            Err(e) => warn!(task_id = %self.task_id, error = %e, "Failed to record progress"),
        }
    }
}

/// Clamp a reported fraction into `[0, 1]`. Non-finite values become 0.
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// Parse a `##progress <fraction> [message]` line.
///
/// The fraction may also be written as a percentage (`42%`).
pub fn parse_progress_line(line: &str) -> Option<(f64, Option<String>)> {
    let rest = line.trim().strip_prefix(PROGRESS_MARKER)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let rest = rest.trim_start();
    let (value, message) = match rest.split_once(char::is_whitespace) {
        Some((value, message)) => (value, Some(message.trim())),
        None => (rest, None),
    };

    let progress = match value.strip_suffix('%') {
        Some(percent) => percent.parse::<f64>().ok()? / 100.0,
        None => value.parse::<f64>().ok()?,
    };
    let message = message.filter(|m| !m.is_empty()).map(str::to_string);
    Some((progress, message))
}
