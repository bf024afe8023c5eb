//! REST endpoints for pipelines and tasks.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::AppState;
use crate::error::SubmitError;
use crate::interrupt::InterruptOutcome;
use crate::queue;
use crate::tasks::{JobSpec, TaskId};
use crate::worker::ProgressReporter;
use crate::worker::read_log;

/// Build the task routes (without CORS).
pub fn task_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pipelines/run", post(run_pipeline))
        .route("/tasks/queue", get(list_queue))
        .route("/tasks/{id}/status", get(task_status))
        .route("/tasks/{id}/parameters", get(task_parameters))
        .route("/tasks/{id}/output", get(task_output))
        .route("/tasks/{id}/logs", get(task_logs))
        .route("/tasks/{id}/progress", post(report_progress))
        .route("/tasks/{id}/interrupt", post(interrupt_task))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "pipeline-orchestrator"
    }))
}

// ── Submission ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RunRequest {
    #[serde(flatten)]
    job: JobSpec,
    /// Run no earlier than this instant.
    #[serde(default)]
    eta: Option<DateTime<Utc>>,
}

async fn run_pipeline(
    State(state): State<AppState>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection, "Rejected pipeline run request");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    let submitted = match request.eta {
        Some(eta) => state.submitter.schedule(request.job, eta).await,
        None => state.submitter.submit(request.job).await,
    };

    match submitted {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "pipeline_id": id,
                "message": "Pipeline run queued successfully."
            })),
        )
            .into_response(),
        Err(SubmitError::InvalidJob(reason)) => error_response(StatusCode::BAD_REQUEST, reason),
        Err(e) => {
            error!(error = %e, "Failed to queue pipeline run");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn list_queue(State(state): State<AppState>) -> Response {
    match queue::snapshot(state.queue.as_ref()).await {
        Ok(snapshot) => {
            let message = format!(
                "Found {} pending and {} scheduled tasks.",
                snapshot.pending.len(),
                snapshot.scheduled.len()
            );
            Json(json!({
                "pending_tasks": snapshot.pending,
                "scheduled_tasks": snapshot.scheduled,
                "message": message,
            }))
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to read queue");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Task records ────────────────────────────────────────────────────────

async fn task_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = TaskId::from(id);
    match state.resolver.resolve(&id).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Task {id} not found")),
        Err(e) => {
            error!(task_id = %id, error = %e, "Failed to resolve status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn task_parameters(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = TaskId::from(id);
    match state.records.parameters(&id).await {
        Ok(Some(parameters)) => Json(json!({
            "task_id": id,
            "parameters": parameters,
        }))
        .into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("Parameters for task {id} not found. They may have expired or were not stored."),
        ),
        Err(e) => {
            error!(task_id = %id, error = %e, "Failed to read parameters");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn task_output(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = TaskId::from(id);
    match state.records.output_location(&id).await {
        Ok(Some(location)) => Json(json!({
            "task_id": id,
            "output_location": location,
        }))
        .into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("No output location recorded for task {id}"),
        ),
        Err(e) => {
            error!(task_id = %id, error = %e, "Failed to read output location");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    if query.tail == Some(0) {
        return error_response(StatusCode::BAD_REQUEST, "tail must be at least 1");
    }
    let id = TaskId::from(id);
    match read_log(&state.logs_dir, &id, query.tail).await {
        Ok(Some(logs)) => Json(json!({
            "task_id": id,
            "logs": logs,
        }))
        .into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("Log file for task {id} not found"),
        ),
        Err(e) => {
            error!(task_id = %id, error = %e, "Failed to read run log");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Control ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ProgressRequest {
    progress: f64,
    #[serde(default)]
    message: Option<String>,
}

async fn report_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ProgressRequest>,
) -> StatusCode {
    let reporter = ProgressReporter::new(state.records.clone(), TaskId::from(id));
    reporter.report(body.progress, body.message.as_deref()).await;
    StatusCode::NO_CONTENT
}

async fn interrupt_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = TaskId::from(id);
    info!(task_id = %id, "Interrupt requested");
    match state.interrupts.interrupt(&id).await {
        Ok(InterruptOutcome::Interrupted {
            message,
            method,
            pid,
        }) => Json(json!({
            "message": message,
            "method": method,
            "pid": pid,
        }))
        .into_response(),
        Ok(InterruptOutcome::Revoked { message }) => Json(json!({
            "message": message,
            "method": "REVOKE",
        }))
        .into_response(),
        Ok(InterruptOutcome::Conflict { status, message }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": message,
                "status": status,
            })),
        )
            .into_response(),
        Ok(InterruptOutcome::NotFound { message }) => {
            error_response(StatusCode::NOT_FOUND, message)
        }
        Err(e) => {
            error!(task_id = %id, error = %e, "Interrupt failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
