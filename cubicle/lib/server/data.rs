//! Request and response bodies for the REST API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    runtime::{JobStatus, UpstreamDescriptor},
    snapshot::Snapshot,
    CubicleError,
};

//--------------------------------------------------------------------------------------------------
// Types: Requests
//--------------------------------------------------------------------------------------------------

/// Body for `POST /sandboxes`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSandboxRequest {
    /// Optional caller-chosen identifier.
    pub sandbox_id: Option<String>,

    /// Number of virtual CPUs.
    pub vcpu_count: Option<u8>,

    /// Guest memory in MiB.
    pub mem_size_mib: Option<u32>,
}

/// Body for `POST /sandboxes/{id}/exec`.
#[derive(Debug, Deserialize)]
pub struct ExecBody {
    /// Program and arguments.
    pub argv: Vec<String>,

    /// Text fed to the child's stdin.
    pub stdin: Option<String>,

    /// Wall-clock budget in seconds; the configured default applies when
    /// omitted.
    pub timeout_seconds: Option<u64>,
}

/// The upstream field of a preview registration.
#[derive(Debug, Deserialize)]
pub struct UpstreamBody {
    /// Host to dial.
    pub host: String,

    /// Port to dial.
    pub port: u16,

    /// `http` or `https`; defaults to `http`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

/// Body for `POST /sandboxes/{id}/preview`.
#[derive(Debug, Deserialize)]
pub struct PreviewBody {
    /// The exposed port.
    pub port: u16,

    /// Explicit upstream; defaults to the sandbox's loopback on `port`.
    pub upstream: Option<UpstreamBody>,
}

/// Body for `POST /sandboxes/{id}/keepalive`.
#[derive(Debug, Deserialize)]
pub struct KeepaliveBody {
    /// Seconds to extend the deadline by.
    pub ttl_seconds: u64,
}

/// Body for `POST /sandboxes/{id}/mount`.
#[derive(Debug, Deserialize)]
pub struct MountBody {
    /// Absolute host path to attach.
    pub host_path: String,

    /// Where the path appears inside the sandbox.
    pub guest_path: String,

    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Body for `POST /sandboxes/{id}/background`.
#[derive(Debug, Deserialize)]
pub struct BackgroundBody {
    /// Program and arguments for the job.
    pub argv: Vec<String>,
}

/// Body for `POST /snapshot/create`.
#[derive(Debug, Default, Deserialize)]
pub struct SnapshotCreateBody {
    /// The sandbox to archive; resolved to the caller's only sandbox when
    /// omitted.
    pub sandbox_id: Option<String>,
}

/// Body for `POST /snapshot/restore`.
#[derive(Debug, Deserialize)]
pub struct SnapshotRestoreBody {
    /// The snapshot to restore.
    pub snapshot_id: String,

    /// The sandbox whose workspace is replaced.
    pub sandbox_id: String,
}

//--------------------------------------------------------------------------------------------------
// Types: Responses
//--------------------------------------------------------------------------------------------------

/// Response for `POST /sandboxes`.
#[derive(Debug, Serialize)]
pub struct CreateSandboxResponse {
    /// The new sandbox's identifier.
    pub sandbox_id: String,

    /// The workspace path on the host.
    pub workspace: String,
}

/// Response for preview registration.
#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    /// Path clients hit on this control plane.
    pub url: String,

    /// Where the proxy currently dials.
    pub upstream: UpstreamDescriptor,
}

/// Response for `POST /sandboxes/{id}/background`.
#[derive(Debug, Serialize)]
pub struct BackgroundResponse {
    /// The new job's identifier.
    pub job_id: String,
}

/// Response for stopping a background job.
#[derive(Debug, Serialize)]
pub struct StopBackgroundResponse {
    /// Whether the job is now stopped.
    pub stopped: bool,

    /// The job's last observed status.
    pub status: JobStatus,
}

/// Response for `GET /snapshot/list`.
#[derive(Debug, Serialize)]
pub struct SnapshotListResponse {
    /// Newest first.
    pub snapshots: Vec<Snapshot>,
}

/// A generic success acknowledgement.
#[derive(Debug, Serialize)]
pub struct OkResponse {
    /// Always true.
    pub success: bool,
}

/// Standard error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// HTTP status code.
    pub code: u16,

    /// Human-readable message.
    pub message: String,

    /// Stable error kind for programmatic handling.
    pub error_type: &'static str,
}

/// Error wrapper giving every handler the §7 status mapping.
#[derive(Debug)]
pub struct ApiError(pub CubicleError);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OkResponse {
    /// The canonical success body.
    pub fn new() -> Self {
        Self { success: true }
    }
}

impl Default for OkResponse {
    fn default() -> Self {
        Self::new()
    }
}

fn default_scheme() -> String {
    "http".to_string()
}

fn error_type(error: &CubicleError) -> &'static str {
    match error {
        CubicleError::NotFound(_) => "not_found",
        CubicleError::InvalidArgument(_) => "invalid_argument",
        CubicleError::PreconditionFailed(_) => "precondition_failed",
        CubicleError::QuotaExceeded(_) => "quota_exceeded",
        CubicleError::TimedOut(_) => "timed_out",
        CubicleError::Transient(_) => "transient",
        CubicleError::Upstream(_) => "upstream",
        _ => "internal",
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<CubicleError> for ApiError {
    fn from(error: CubicleError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        // Internal detail stays in the logs for 5xx; clients get the category.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorResponse {
            code: status.as_u16(),
            message,
            error_type: error_type(&self.0),
        };
        (status, Json(body)).into_response()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuotaKind;

    #[test]
    fn test_error_mapping() {
        let response = ApiError(CubicleError::NotFound("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response =
            ApiError(CubicleError::QuotaExceeded(QuotaKind::ConcurrentExec)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = ApiError(CubicleError::Fatal("secret".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
