//! Defines the routes of the status server.
//!
//! - `GET /healthz` liveness
//! - `GET /readyz` SQLite and backup directory checks
//! - `GET /status` full backup and replication report
//! - `GET /status/{bucket}` one bucket's backup status

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        status_handlers::{bucket_status, status},
    },
    state::AppState,
};
use axum::{Router, routing::get};

/// Build the router. Handlers share [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/status/{bucket}", get(bucket_status))
}
