//! Admin HTTP API
//!
//! Read-mostly surface over a migration node:
//! - `GET /health`
//! - `GET /migration/status`: latest progress snapshot
//! - `GET /migration/statistics`: per-status and per-shard counts
//! - `GET /migration/verify`: placement check against the router
//! - `POST /migration/start`: spawn a run, 409 while one is in progress

use crate::common::{Error, HASH_CONTRACT};
use crate::migration::{MigrationOrchestrator, ProgressRegistry, StatisticsService};
use crate::ops::verify_placement;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct AdminState {
    orchestrator: Arc<MigrationOrchestrator>,
    progress: ProgressRegistry,
    statistics: Arc<StatisticsService>,
    running: Arc<AtomicBool>,
}

/// Clears the running flag when the run task ends, panics included
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AdminState {
    pub fn new(
        orchestrator: Arc<MigrationOrchestrator>,
        progress: ProgressRegistry,
        statistics: Arc<StatisticsService>,
    ) -> Self {
        Self {
            orchestrator,
            progress,
            statistics,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn a run in the background. Returns false if one is already going.
    pub fn start_run(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let guard = RunningGuard(self.running.clone());
        let orchestrator = self.orchestrator.clone();
        let progress = self.progress.begin_run();
        tokio::spawn(async move {
            let _guard = guard;
            // outcome is logged by the orchestrator and kept in the snapshot
            let _ = orchestrator.run(&progress).await;
        });
        true
    }
}

fn error_response(e: Error) -> Response {
    (e.to_http_status(), Json(json!({ "error": e.to_string() }))).into_response()
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "hashContract": HASH_CONTRACT,
        "running": state.is_running(),
    }))
}

async fn migration_status(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.progress.latest_status())
}

async fn migration_statistics(State(state): State<AdminState>) -> Response {
    match state.statistics.statistics() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

async fn migration_verify(State(state): State<AdminState>) -> Response {
    let coordinator = state.orchestrator.coordinator();
    match verify_placement(coordinator.stores(), coordinator.router()) {
        Ok(report) => Json(json!({ "clean": report.is_clean(), "report": report })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn migration_start(State(state): State<AdminState>) -> Response {
    if state.start_run() {
        tracing::info!("migration run started via admin API");
        (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a migration run is already in progress" })),
        )
            .into_response()
    }
}

pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/migration/status", axum::routing::get(migration_status))
        .route("/migration/statistics", axum::routing::get(migration_statistics))
        .route("/migration/verify", axum::routing::get(migration_verify))
        .route("/migration/start", axum::routing::post(migration_start))
        .with_state(state)
}
