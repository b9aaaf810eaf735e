//! Error types shared across the cubicle control plane.

use std::{error::Error, fmt::Display};

use axum::http::StatusCode;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a cubicle-related operation.
pub type CubicleResult<T> = Result<T, CubicleError>;

/// An error that occurred during a control-plane operation.
#[derive(Debug, Error)]
pub enum CubicleError {
    /// A sandbox, snapshot, or path does not exist or does not belong to the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// A malformed identifier, out-of-range port, disallowed path, or unsupported
    /// driver operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The sandbox is in the wrong state for the requested operation.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A quota hard cap was hit during admission.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaKind),

    /// An exec, proxy dial, or external I/O exceeded its budget.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// A transient failure against storage or a driver, eligible for retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// An invariant was violated; the caller should abandon the sandbox.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The preview proxy cannot reach the in-sandbox upstream server.
    #[error("upstream unreachable: {0}")]
    Upstream(String),

    /// An error that occurred during an I/O operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred during JSON serialization.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred while parsing a YAML configuration file.
    #[error("config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An error that occurred while joining a blocking task.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// The kind of quota that was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// Executions in the rolling one-hour window.
    ExecRate,

    /// Concurrently running executions.
    ConcurrentExec,

    /// Estimated resident memory.
    Memory,

    /// Workspace storage bytes.
    Storage,

    /// Network egress bytes in the rolling window.
    Egress,

    /// CPU seconds in the rolling window.
    Cpu,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CubicleError {
    /// Creates a new `Err` result from any error.
    pub fn custom(error: impl Into<anyhow::Error>) -> CubicleError {
        CubicleError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Whether this error is eligible for retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, CubicleError::Transient(_))
    }

    /// The HTTP status code this error maps to at the façade boundary.
    pub fn http_status(&self) -> StatusCode {
        match self {
            CubicleError::NotFound(_) => StatusCode::NOT_FOUND,
            CubicleError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CubicleError::PreconditionFailed(_) => StatusCode::CONFLICT,
            CubicleError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            CubicleError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            CubicleError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl QuotaKind {
    /// The label value used for `quota_violations_total{kind=…}`.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::ExecRate => "exec_rate",
            QuotaKind::ConcurrentExec => "concurrent_exec",
            QuotaKind::Memory => "memory",
            QuotaKind::Storage => "storage",
            QuotaKind::Egress => "egress",
            QuotaKind::Cpu => "cpu",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `CubicleResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> CubicleResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
