//! End-to-end tests: HTTP API + libSQL store/queue + worker pool + real child
//! processes.
//!
//! Each test spins up the router on a random port, drives it with reqwest, and
//! uses a small `sh` launcher whose behaviour depends on the target name.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use pipeline_orchestrator::api::{self, AppState};
use pipeline_orchestrator::config::{
    ExecutorConfig, InterruptConfig, RetentionConfig, WorkerPoolConfig,
};
use pipeline_orchestrator::interrupt::{OsProcesses, ProcessControl};
use pipeline_orchestrator::queue::TaskQueue;
use pipeline_orchestrator::store::{LibSqlBackend, ProcessHandle, StateStore, TaskRecords};
use pipeline_orchestrator::tasks::TaskId;
use pipeline_orchestrator::worker::{Executor, spawn_worker_pool};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

const LAUNCHER: &str = r###"
case "$2" in
  ok)
    echo "hello from pipeline"
    echo "##progress 0.5 halfway"
    exit 0 ;;
  fail)
    echo "boom" >&2
    exit 3 ;;
  slow)
    exec sleep 30 ;;
  stubborn)
    trap '' INT
    exec sleep 30 ;;
esac
exit 1
"###;

struct Server {
    base: String,
    records: TaskRecords,
    client: reqwest::Client,
    shutdown: Option<Arc<AtomicBool>>,
    _dir: tempfile::TempDir,
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(flag) = &self.shutdown {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

/// Start the full service. Without workers, submitted tasks stay queued.
async fn start_server(with_workers: bool) -> Server {
    let dir = tempfile::tempdir().unwrap();
    let launcher = dir.path().join("launch.sh");
    std::fs::write(&launcher, LAUNCHER).unwrap();

    let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let store: Arc<dyn StateStore> = backend.clone();
    let queue: Arc<dyn TaskQueue> = backend;
    let records = TaskRecords::new(store, RetentionConfig::default());
    let processes: Arc<dyn ProcessControl> = Arc::new(OsProcesses::new());

    let executor_config = ExecutorConfig {
        program: "sh".into(),
        launcher: launcher.to_string_lossy().into_owned(),
        workdir: dir.path().to_path_buf(),
        logs_dir: dir.path().join("logs"),
        cleanup_term_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let interrupt_config = InterruptConfig {
        grace_period: Duration::from_millis(500),
        poll_interval: Duration::from_millis(50),
        kill_wait: Duration::from_millis(300),
        signature: "launch.sh".into(),
    };

    let shutdown = if with_workers {
        let executor = Arc::new(Executor::new(
            records.clone(),
            Arc::clone(&processes),
            executor_config.clone(),
        ));
        let (_, flag) = spawn_worker_pool(
            Arc::clone(&queue),
            executor,
            WorkerPoolConfig {
                workers: 2,
                poll_interval: Duration::from_millis(20),
            },
        );
        Some(flag)
    } else {
        None
    };

    let state = AppState::new(
        records.clone(),
        queue,
        processes,
        interrupt_config,
        executor_config.logs_dir.clone(),
    );
    let app = api::router(state, &[]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://127.0.0.1:{port}"),
        records,
        client: reqwest::Client::new(),
        shutdown,
        _dir: dir,
    }
}

impl Server {
    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Option<Value>) -> (u16, Value) {
        let mut request = self.client.post(format!("{}{path}", self.base));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn submit(&self, target: &str) -> String {
        let (status, body) = self
            .post("/pipelines/run", Some(json!({"target": target})))
            .await;
        assert_eq!(status, 202, "{body}");
        body["pipeline_id"].as_str().unwrap().to_string()
    }

    /// Poll the status endpoint until it reports `wanted`.
    async fn wait_status(&self, id: &str, wanted: &str) -> Value {
        loop {
            let (code, body) = self.get(&format!("/tasks/{id}/status")).await;
            if code == 200 && body["status"] == wanted {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait until the worker has published the child's pid.
    async fn wait_pid(&self, id: &str) -> u32 {
        let id = TaskId::from(id);
        loop {
            if let Some(ProcessHandle::Valid(pid)) = self.records.process_handle(&id).await.unwrap() {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn log_exists(dir: &Path, id: &str) -> bool {
    dir.join("logs").join(format!("{id}.log")).exists()
}

#[tokio::test]
async fn successful_run_is_completed_with_parameters_and_logs() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let id = server.submit("ok").await;

        let status = server.wait_status(&id, "COMPLETED").await;
        assert_eq!(status["progress"], 1.0);
        assert_eq!(status["details"]["exit_code"], 0);

        let (code, params) = server.get(&format!("/tasks/{id}/parameters")).await;
        assert_eq!(code, 200);
        assert_eq!(params["parameters"]["task_id"], id.as_str());

        assert!(log_exists(server._dir.path(), &id));
        let (code, logs) = server.get(&format!("/tasks/{id}/logs")).await;
        assert_eq!(code, 200);
        assert!(logs["logs"].as_str().unwrap().contains("hello from pipeline"));

        // The process handle is gone once the run is over.
        assert!(server
            .records
            .process_handle(&TaskId::from(id.as_str()))
            .await
            .unwrap()
            .is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failing_run_reports_exit_code() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let id = server.submit("fail").await;

        let status = server.wait_status(&id, "FAILED").await;
        assert_eq!(status["details"]["exit_code"], 3);

        let (_, logs) = server.get(&format!("/tasks/{id}/logs?tail=5")).await;
        assert!(logs["logs"].as_str().unwrap().contains("boom"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn interrupting_a_running_task_revokes_it() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let id = server.submit("slow").await;
        server.wait_pid(&id).await;

        let (code, body) = server.post(&format!("/tasks/{id}/interrupt"), None).await;
        assert_eq!(code, 200, "{body}");
        assert_eq!(body["method"], "SIGINT");

        let status = server.wait_status(&id, "REVOKED").await;
        assert_eq!(status["details"]["method"], "SIGINT");

        // The worker saw a signal exit but must not replace REVOKED.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (_, status) = server.get(&format!("/tasks/{id}/status")).await;
        assert_eq!(status["status"], "REVOKED");

        let (code, body) = server.post(&format!("/tasks/{id}/interrupt"), None).await;
        assert_eq!(code, 409);
        assert_eq!(body["status"], "REVOKED");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn process_ignoring_sigint_is_killed() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let id = server.submit("stubborn").await;
        server.wait_pid(&id).await;
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (code, body) = server.post(&format!("/tasks/{id}/interrupt"), None).await;
        assert_eq!(code, 200, "{body}");
        assert_eq!(body["method"], "SIGKILL");

        server.wait_status(&id, "REVOKED").await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn queued_task_is_listed_then_revoked() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false).await;
        let id = server.submit("ok").await;

        let (_, queue) = server.get("/tasks/queue").await;
        assert_eq!(queue["pending_tasks"], json!([id]));

        let (_, status) = server.get(&format!("/tasks/{id}/status")).await;
        assert_eq!(status["status"], "PENDING");

        let (code, body) = server.post(&format!("/tasks/{id}/interrupt"), None).await;
        assert_eq!(code, 200, "{body}");
        assert_eq!(body["method"], "REVOKE");

        let (_, status) = server.get(&format!("/tasks/{id}/status")).await;
        assert_eq!(status["status"], "REVOKED");
        let (_, queue) = server.get("/tasks/queue").await;
        assert_eq!(queue["pending_tasks"], json!([]));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_task_ids_are_404() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false).await;

        let (code, _) = server.get("/tasks/does-not-exist/status").await;
        assert_eq!(code, 404);
        let (code, _) = server.post("/tasks/does-not-exist/interrupt", None).await;
        assert_eq!(code, 404);
        let (code, _) = server.get("/tasks/does-not-exist/parameters").await;
        assert_eq!(code, 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn finished_task_interrupt_is_409_and_idempotent() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let id = server.submit("ok").await;
        server.wait_status(&id, "COMPLETED").await;

        for _ in 0..2 {
            let (code, body) = server.post(&format!("/tasks/{id}/interrupt"), None).await;
            assert_eq!(code, 409);
            assert_eq!(body["status"], "COMPLETED");
        }
    })
    .await
    .expect("test timed out");
}
