//! Reading run logs back.

use std::path::Path;

use super::launch::log_path;
use crate::tasks::TaskId;

/// Read a task's run log, or only its last `tail` lines.
///
/// Returns `None` when there is no log for the id (including ids that are not
/// safe to use as a file name).
pub async fn read_log(
    logs_dir: &Path,
    task_id: &TaskId,
    tail: Option<usize>,
) -> std::io::Result<Option<String>> {
    if !task_id.is_path_safe() {
        return Ok(None);
    }

    let content = match tokio::fs::read(log_path(logs_dir, task_id)).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    Ok(Some(match tail {
        Some(n) => tail_lines(&content, n),
        None => content,
    }))
}

fn tail_lines(content: &str, n: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() && content.ends_with('\n') {
        out.push('\n');
    }
    out
}
