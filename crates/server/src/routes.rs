//! Route configuration.

use crate::handlers;
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/files/{token}/{filename}", get(handlers::access_file))
        .route("/blks/{token}/{block_id}", get(handlers::access_blks))
        .route("/zip/{token}", get(handlers::access_zip))
        .route(
            "/upload-api/{token}",
            post(handlers::upload_api).options(handlers::upload::upload_options),
        )
        .route(
            "/upload-aj/{token}",
            post(handlers::upload_ajax).options(handlers::upload::upload_options),
        )
        // Upload sizes are policed by max_upload_size and the quota
        // oracle, not by the framework default.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
