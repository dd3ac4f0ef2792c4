mod health;
mod index;
mod metrics;
mod process;

use crate::server::SharedState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

/// Uploads from phone cameras easily exceed axum's 2 MB default.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/api/upload", post(process::upload_image))
        .route("/api/capture/{camera}", post(process::capture_frame))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
