//! HTTP middleware: per-request metric recording.

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};

use super::state::AppState;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Records `http_requests_total` and `http_request_duration_seconds`.
///
/// The route template (not the concrete path) is used as the `path` label to
/// keep cardinality bounded.
pub async fn track_http(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let timer = std::time::Instant::now();

    let response = next.run(request).await;

    state
        .metrics
        .http_requests_total
        .with_label_values(&[&method, &path, response.status().as_str()])
        .inc();
    state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, &path])
        .observe(timer.elapsed().as_secs_f64());

    response
}
