//! Building the pipeline command line and running the child with its output
//! teed into the run log.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::progress::{ProgressReporter, parse_progress_line};
use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::tasks::{JobSpec, ParamMap, TaskId};

/// Environment variable carrying the task id into the child.
pub const TASK_ID_ENV: &str = "PIPELINE_TASK_ID";

/// Flag preceding the flat parameter JSON on every pipeline command line.
pub const OVERRIDE_JSON_FLAG: &str = "--override-json";

/// A fully resolved child invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// `<program> <launcher> --target <target> [--config <path>] [--override-json <json>]`
    pub fn build(
        config: &ExecutorConfig,
        task_id: &TaskId,
        job: &JobSpec,
        config_path: Option<&Path>,
        params: &ParamMap,
    ) -> Result<Self, ExecutionError> {
        let mut args = vec![
            config.launcher.clone(),
            "--target".to_string(),
            job.target.clone(),
        ];

        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.to_string_lossy().into_owned());
        }

        if !params.is_empty() {
            let json = serde_json::to_string(params)
                .map_err(|e| ExecutionError::Serialization(e.to_string()))?;
            args.push(OVERRIDE_JSON_FLAG.to_string());
            args.push(json);
        }

        Ok(Self {
            program: config.program.clone(),
            args,
            workdir: config.workdir.clone(),
            env: vec![(TASK_ID_ENV.to_string(), task_id.to_string())],
        })
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Start the child with piped output.
    pub fn spawn(&self) -> Result<Child, ExecutionError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
            .spawn()
            .map_err(|e| ExecutionError::Spawn(format!("{}: {e}", self.program)))
    }
}

/// Path of the run log for a task.
pub fn log_path(logs_dir: &Path, task_id: &TaskId) -> PathBuf {
    logs_dir.join(format!("{task_id}.log"))
}

/// Append-only run log shared by the output pumps. Writes go nowhere if the
/// file could not be opened.
#[derive(Clone)]
pub struct RunLog {
    file: Arc<Mutex<Option<File>>>,
}

impl RunLog {
    pub async fn open(logs_dir: &Path, task_id: &TaskId) -> Self {
        if !task_id.is_path_safe() {
            warn!(task_id = %task_id, "Task id not usable as a file name, discarding output");
            return Self::discard();
        }
        let path = log_path(logs_dir, task_id);
        let file = match open_append(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(task_id = %task_id, path = %path.display(), error = %e, "Run log unavailable, discarding output");
                None
            }
        };
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    /// A log that drops everything written to it.
    pub fn discard() -> Self {
        Self {
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn write_line(&self, line: &str) {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            let result = async {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await
            }
            .await;
            if let Err(e) = result {
                warn!(error = %e, "Run log write failed, discarding further output");
                *guard = None;
            }
        }
    }

    /// Flush and release the file handle.
    pub async fn close(&self) {
        if let Some(mut file) = self.file.lock().await.take() {
            let _ = file.flush().await;
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Copy the child's stdout and stderr into the run log. Stdout progress lines
/// are forwarded to the reporter.
pub fn pump_output(
    child: &mut Child,
    log: &RunLog,
    reporter: &ProgressReporter,
) -> Vec<JoinHandle<()>> {
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(spawn_pump(stdout, log.clone(), Some(reporter.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(spawn_pump(stderr, log.clone(), None));
    }
    pumps
}

fn spawn_pump<R>(reader: R, log: RunLog, reporter: Option<ProgressReporter>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(reporter) = &reporter {
                        if let Some((progress, message)) = parse_progress_line(&line) {
                            reporter.report(progress, message.as_deref()).await;
                        }
                    }
                    log.write_line(&line).await;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
    })
}
