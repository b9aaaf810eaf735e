//! Route definitions for the control-plane API.

use axum::{
    middleware,
    routing::{any, delete, get, post, put},
    Router,
};

use super::{handlers, middleware::track_http, state::AppState};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the router over shared state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/sandboxes", post(handlers::create_sandbox))
        .route("/sandboxes", get(handlers::list_sandboxes))
        .route("/sandboxes/{id}", delete(handlers::destroy_sandbox))
        .route("/sandboxes/{id}/exec", post(handlers::exec_command))
        .route("/sandboxes/{id}/files", get(handlers::list_files))
        .route("/sandboxes/{id}/files/{*path}", put(handlers::write_file))
        .route("/sandboxes/{id}/files/{*path}", get(handlers::read_file))
        .route(
            "/sandboxes/{id}/files/{*path}",
            delete(handlers::delete_file),
        )
        .route("/sandboxes/{id}/preview", post(handlers::register_preview))
        .route("/sandboxes/{id}/keepalive", post(handlers::keepalive))
        .route("/sandboxes/{id}/mount", post(handlers::mount))
        .route("/sandboxes/{id}/background", post(handlers::start_background))
        .route(
            "/sandboxes/{id}/background/{job_id}",
            delete(handlers::stop_background),
        )
        .route("/sandboxes/{id}/usage", get(handlers::usage))
        .route("/sandboxes/{id}/terminal", get(handlers::terminal))
        .route("/snapshot/create", post(handlers::snapshot_create))
        .route("/snapshot/restore", post(handlers::snapshot_restore))
        .route("/snapshot/list", get(handlers::snapshot_list))
        .route("/snapshot/{snapshot_id}", delete(handlers::snapshot_delete))
        .route("/previews", get(handlers::list_previews))
        .route("/preview/{sandbox_id}/{port}", any(handlers::proxy_root))
        .route(
            "/preview/{sandbox_id}/{port}/{*path}",
            any(handlers::proxy_path),
        )
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::health_ready))
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::from_fn_with_state(state.clone(), track_http))
        .with_state(state)
}
