//! HTTP surface over the submitter, status resolver and interrupt controller.

pub mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};

use crate::config::InterruptConfig;
use crate::interrupt::{InterruptController, ProcessControl};
use crate::queue::TaskQueue;
use crate::status::StatusResolver;
use crate::store::TaskRecords;
use crate::submit::Submitter;

pub use routes::task_routes;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub submitter: Arc<Submitter>,
    pub resolver: Arc<StatusResolver>,
    pub interrupts: Arc<InterruptController>,
    pub records: TaskRecords,
    pub queue: Arc<dyn TaskQueue>,
    /// Where run logs are read from.
    pub logs_dir: PathBuf,
}

impl AppState {
    pub fn new(
        records: TaskRecords,
        queue: Arc<dyn TaskQueue>,
        processes: Arc<dyn ProcessControl>,
        interrupt: InterruptConfig,
        logs_dir: PathBuf,
    ) -> Self {
        Self {
            submitter: Arc::new(Submitter::new(Arc::clone(&queue))),
            resolver: Arc::new(StatusResolver::new(records.clone(), Arc::clone(&queue))),
            interrupts: Arc::new(InterruptController::new(
                records.clone(),
                Arc::clone(&queue),
                processes,
                interrupt,
            )),
            records,
            queue,
            logs_dir,
        }
    }
}

/// Full router: task routes plus CORS for the given origins.
///
/// An empty origin list allows any origin.
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    task_routes(state).layer(cors_layer(cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();
    let layer = CorsLayer::new().allow_headers(Any).allow_methods(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}
