//! The preview-port reverse proxy.
//!
//! Resolves `(sandbox_id, port)` against the runtime's port registry, streams
//! HTTP and WebSocket traffic to the upstream, and promotes a target to a
//! fallback replica once its consecutive-failure budget is burned.

mod http;
mod ws;

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Request, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    RequestExt,
};
use dashmap::DashMap;
use prometheus::IntGauge;
use tracing::{debug, warn};

use self::http::AttemptError;
use crate::{
    config::Config,
    metrics::Metrics,
    runtime::{SandboxManager, UpstreamDescriptor},
    CubicleError, CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Request bodies are buffered up to this size so a failed attempt can be
/// retried against a promoted upstream.
const MAX_BUFFERED_BODY: usize = 32 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Streams preview traffic into sandboxes.
pub struct PreviewProxy {
    manager: Arc<SandboxManager>,
    metrics: Arc<Metrics>,
    client: reqwest::Client,
    error_budget: u32,
    /// Consecutive failures per `(sandbox_id, port)`; reset on success.
    failures: DashMap<(String, u16), u32>,
}

/// RAII guard for the in-flight gauge.
struct InFlight(IntGauge);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl InFlight {
    fn enter(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec();
    }
}

impl PreviewProxy {
    /// Creates the proxy over the runtime's registry.
    pub fn new(
        config: &Config,
        manager: Arc<SandboxManager>,
        metrics: Arc<Metrics>,
    ) -> CubicleResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(
                *config.get_proxy_upstream_timeout_seconds(),
            ))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(CubicleError::custom)?;

        Ok(Self {
            manager,
            metrics,
            client,
            error_budget: *config.get_proxy_error_budget(),
            failures: DashMap::new(),
        })
    }

    /// Handles one proxied request.
    ///
    /// `path` is the remainder after the `/preview/<sandbox>/<port>` prefix was
    /// stripped by routing; empty means the upstream root.
    pub async fn handle(
        &self,
        sandbox_id: String,
        port: u16,
        path: String,
        mut request: Request,
    ) -> Response {
        let _in_flight = InFlight::enter(&self.metrics.preview_proxy_in_flight);

        let Some(upstream) = self.manager.resolve_preview(&sandbox_id, port) else {
            return (StatusCode::BAD_GATEWAY, "NotListening").into_response();
        };

        let query = request
            .uri()
            .query()
            .map(|q| format!("?{}", q))
            .unwrap_or_default();
        let suffix = upstream_suffix(&path, &query);

        if is_websocket(&request) {
            return match request.extract_parts::<WebSocketUpgrade>().await {
                Ok(upgrade) => {
                    self.handle_websocket(upgrade, &sandbox_id, port, upstream, &suffix)
                        .await
                }
                Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
            };
        }

        let method = request.method().clone();
        let headers = request.headers().clone();
        let body = match axum::body::to_bytes(
            std::mem::replace(request.body_mut(), Body::empty()),
            MAX_BUFFERED_BODY,
        )
        .await
        {
            Ok(body) => body,
            Err(e) => {
                return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response();
            }
        };

        let mut upstream = upstream;
        let mut promoted = false;
        loop {
            let url = format!("{}{}", upstream.base_url(), suffix);
            match http::forward(&self.client, method.clone(), &url, &headers, body.clone()).await {
                Ok(response) => {
                    self.failures.remove(&(sandbox_id.clone(), port));
                    return response;
                }
                Err(error) => {
                    if promoted {
                        // Exactly one retry after promotion; a second failure
                        // goes to the client.
                        return gateway_error(error);
                    }
                    let burned = self.record_failure(&sandbox_id, port);
                    debug!(
                        sandbox_id,
                        port,
                        url,
                        consecutive = burned,
                        error = ?error,
                        "upstream attempt failed"
                    );

                    if burned < self.error_budget {
                        // Budget not burned yet; spend another attempt.
                        continue;
                    }
                    match self.manager.promote_to_fallback(&sandbox_id, port).await {
                        Ok(new_upstream) => {
                            promoted = true;
                            self.failures.remove(&(sandbox_id.clone(), port));
                            upstream = new_upstream;
                        }
                        Err(e) => {
                            warn!(sandbox_id, port, error = %e, "fallback promotion failed");
                            return gateway_error(error);
                        }
                    }
                }
            }
        }
    }

    async fn handle_websocket(
        &self,
        upgrade: WebSocketUpgrade,
        sandbox_id: &str,
        port: u16,
        upstream: UpstreamDescriptor,
        suffix: &str,
    ) -> Response {
        // Establish the upstream leg first; the client upgrade completes only
        // once there is something to bridge to.
        let mut upstream = upstream;
        let mut promoted = false;
        let socket = loop {
            let url = format!("ws://{}:{}{}", upstream.host, upstream.port, suffix);
            match ws::connect(&url).await {
                Ok(socket) => {
                    self.failures.remove(&(sandbox_id.to_string(), port));
                    break socket;
                }
                Err(e) => {
                    if promoted {
                        return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
                    }
                    let burned = self.record_failure(sandbox_id, port);
                    if burned < self.error_budget {
                        continue;
                    }
                    match self.manager.promote_to_fallback(sandbox_id, port).await {
                        Ok(new_upstream) => {
                            promoted = true;
                            self.failures.remove(&(sandbox_id.to_string(), port));
                            upstream = new_upstream;
                        }
                        Err(promote_err) => {
                            warn!(sandbox_id, port, error = %promote_err, "fallback promotion failed");
                            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
                        }
                    }
                }
            }
        };
        ws::bridge(upgrade, socket)
    }

    fn record_failure(&self, sandbox_id: &str, port: u16) -> u32 {
        let mut entry = self
            .failures
            .entry((sandbox_id.to_string(), port))
            .or_insert(0);
        *entry += 1;
        *entry
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Joins the stripped path remainder and query into the upstream suffix.
fn upstream_suffix(path: &str, query: &str) -> String {
    let path = path.trim_start_matches('/');
    format!("/{}{}", path, query)
}

fn is_websocket(request: &Request) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn gateway_error(error: AttemptError) -> Response {
    match error {
        AttemptError::Dial(message) => (StatusCode::BAD_GATEWAY, message).into_response(),
        AttemptError::Gateway(status) => {
            (StatusCode::BAD_GATEWAY, format!("upstream returned {}", status)).into_response()
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
