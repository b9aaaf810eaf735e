//! Request handlers: thin validation and dispatch over the runtime, snapshot
//! engine, and proxy.

use std::{path::PathBuf, time::Duration};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Path, Query, Request, State, WebSocketUpgrade,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    data::{
        ApiError, BackgroundBody, BackgroundResponse, CreateSandboxRequest, CreateSandboxResponse,
        ErrorResponse, ExecBody, KeepaliveBody, MountBody, OkResponse, PreviewBody,
        PreviewResponse, SnapshotCreateBody, SnapshotListResponse, SnapshotRestoreBody,
        StopBackgroundResponse,
    },
    state::AppState,
};
use crate::{
    isolation::{DriverStream, ExecOutcome, ResourceCaps},
    quota::QuotaUsage,
    runtime::{CreateOptions, JobStatus, PreviewTarget, SandboxInfo, UpstreamDescriptor, WorkspaceEntry},
    snapshot::Snapshot,
    utils::validate_id,
    CubicleError,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The verified caller identity, taken from the `x-user-id` header.
///
/// Token verification happens in the identity collaborator upstream of this
/// service; the façade only consumes the resulting identifier.
pub struct UserId(pub String);

/// Query parameters for directory listings.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Directory inside the workspace; the root when omitted.
    #[serde(default)]
    pub path: String,
}

/// Result alias for JSON handlers.
type Api<T> = Result<Json<T>, ApiError>;

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<S: Send + Sync> axum::extract::FromRequestParts<S> for UserId {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(user_id) = value else {
            return Err(unauthorized("missing x-user-id header"));
        };
        if validate_id(&user_id, "user_id").is_err() {
            return Err(unauthorized("malformed x-user-id header"));
        }
        Ok(UserId(user_id))
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            code: StatusCode::UNAUTHORIZED.as_u16(),
            message: message.to_string(),
            error_type: "unauthorized",
        }),
    )
        .into_response()
}

//--------------------------------------------------------------------------------------------------
// Functions: Sandbox Handlers
//--------------------------------------------------------------------------------------------------

/// `POST /sandboxes`
pub async fn create_sandbox(
    State(state): State<AppState>,
    user: UserId,
    Json(body): Json<CreateSandboxRequest>,
) -> Api<CreateSandboxResponse> {
    let caps = match (body.vcpu_count, body.mem_size_mib) {
        (None, None) => None,
        (vcpus, mem) => Some(
            ResourceCaps::builder()
                .vcpu_count(vcpus.unwrap_or(1))
                .mem_size_mib(mem.unwrap_or(512))
                .build(),
        ),
    };
    let sandbox = state
        .manager
        .create(
            &user.0,
            CreateOptions {
                sandbox_id: body.sandbox_id,
                caps,
            },
        )
        .await?;
    Ok(Json(CreateSandboxResponse {
        sandbox_id: sandbox.sandbox_id.clone(),
        workspace: sandbox.workspace_root.display().to_string(),
    }))
}

/// `GET /sandboxes`
pub async fn list_sandboxes(State(state): State<AppState>, user: UserId) -> Api<Vec<SandboxInfo>> {
    Ok(Json(state.manager.list(&user.0)))
}

/// `DELETE /sandboxes/{id}`
pub async fn destroy_sandbox(
    State(state): State<AppState>,
    user: UserId,
    Path(sandbox_id): Path<String>,
) -> Api<OkResponse> {
    state.manager.destroy(&user.0, &sandbox_id, None).await?;
    Ok(Json(OkResponse::new()))
}

/// `POST /sandboxes/{id}/exec`
pub async fn exec_command(
    State(state): State<AppState>,
    user: UserId,
    Path(sandbox_id): Path<String>,
    Json(body): Json<ExecBody>,
) -> Api<ExecOutcome> {
    let outcome = state
        .manager
        .exec(
            &user.0,
            &sandbox_id,
            body.argv,
            body.stdin.map(Bytes::from),
            body.timeout_seconds.map(Duration::from_secs),
            CancellationToken::new(),
        )
        .await?;
    Ok(Json(outcome))
}

/// `PUT /sandboxes/{id}/files/{path}` — body is the raw file content.
pub async fn write_file(
    State(state): State<AppState>,
    user: UserId,
    Path((sandbox_id, path)): Path<(String, String)>,
    body: Bytes,
) -> Api<OkResponse> {
    state
        .manager
        .write_file(&user.0, &sandbox_id, &path, body)
        .await?;
    Ok(Json(OkResponse::new()))
}

/// `GET /sandboxes/{id}/files/{path}` — responds with the raw bytes.
pub async fn read_file(
    State(state): State<AppState>,
    user: UserId,
    Path((sandbox_id, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let data = state.manager.read_file(&user.0, &sandbox_id, &path).await?;
    Ok(
        (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
    )
}

/// `DELETE /sandboxes/{id}/files/{path}`
pub async fn delete_file(
    State(state): State<AppState>,
    user: UserId,
    Path((sandbox_id, path)): Path<(String, String)>,
) -> Api<OkResponse> {
    state
        .manager
        .delete_file(&user.0, &sandbox_id, &path)
        .await?;
    Ok(Json(OkResponse::new()))
}

/// `GET /sandboxes/{id}/files`
pub async fn list_files(
    State(state): State<AppState>,
    user: UserId,
    Path(sandbox_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Api<Vec<WorkspaceEntry>> {
    let entries = state
        .manager
        .list_dir(&user.0, &sandbox_id, &query.path)
        .await?;
    Ok(Json(entries))
}

/// `POST /sandboxes/{id}/preview`
pub async fn register_preview(
    State(state): State<AppState>,
    user: UserId,
    Path(sandbox_id): Path<String>,
    Json(body): Json<PreviewBody>,
) -> Api<PreviewResponse> {
    let upstream = body.upstream.map(|u| UpstreamDescriptor {
        host: u.host,
        port: u.port,
        scheme: u.scheme,
        driver_kind: state.manager.driver().kind(),
    });
    let upstream = state
        .manager
        .register_preview(&user.0, &sandbox_id, body.port, upstream)?;
    Ok(Json(PreviewResponse {
        url: format!("/preview/{}/{}/", sandbox_id, body.port),
        upstream,
    }))
}

/// `POST /sandboxes/{id}/keepalive`
pub async fn keepalive(
    State(state): State<AppState>,
    user: UserId,
    Path(sandbox_id): Path<String>,
    Json(body): Json<KeepaliveBody>,
) -> Api<OkResponse> {
    state.manager.keepalive(
        &user.0,
        &sandbox_id,
        Duration::from_secs(body.ttl_seconds),
    )?;
    Ok(Json(OkResponse::new()))
}

/// `POST /sandboxes/{id}/mount`
pub async fn mount(
    State(state): State<AppState>,
    user: UserId,
    Path(sandbox_id): Path<String>,
    Json(body): Json<MountBody>,
) -> Api<OkResponse> {
    state
        .manager
        .mount(
            &user.0,
            &sandbox_id,
            &PathBuf::from(body.host_path),
            &body.guest_path,
            body.read_only,
        )
        .await?;
    Ok(Json(OkResponse::new()))
}

/// `POST /sandboxes/{id}/background`
pub async fn start_background(
    State(state): State<AppState>,
    user: UserId,
    Path(sandbox_id): Path<String>,
    Json(body): Json<BackgroundBody>,
) -> Api<BackgroundResponse> {
    let job_id = state
        .manager
        .start_background(&user.0, &sandbox_id, body.argv)
        .await?;
    Ok(Json(BackgroundResponse { job_id }))
}

/// `DELETE /sandboxes/{id}/background/{job_id}`
pub async fn stop_background(
    State(state): State<AppState>,
    user: UserId,
    Path((sandbox_id, job_id)): Path<(String, String)>,
) -> Api<StopBackgroundResponse> {
    let status = state
        .manager
        .stop_background(&user.0, &sandbox_id, &job_id)
        .await?;
    Ok(Json(StopBackgroundResponse {
        stopped: !matches!(status, JobStatus::Running),
        status,
    }))
}

/// `GET /sandboxes/{id}/usage`
pub async fn usage(
    State(state): State<AppState>,
    user: UserId,
    Path(sandbox_id): Path<String>,
) -> Api<QuotaUsage> {
    Ok(Json(state.manager.usage(&user.0, &sandbox_id)?))
}

/// WebSocket `GET /sandboxes/{id}/terminal`
pub async fn terminal(
    State(state): State<AppState>,
    user: UserId,
    Path(sandbox_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    match state.manager.open_terminal(&user.0, &sandbox_id).await {
        Ok(stream) => upgrade.on_upgrade(move |socket| pump_terminal(socket, stream)),
        Err(e) => ApiError(e).into_response(),
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Snapshot Handlers
//--------------------------------------------------------------------------------------------------

/// `POST /snapshot/create`
pub async fn snapshot_create(
    State(state): State<AppState>,
    user: UserId,
    Json(body): Json<SnapshotCreateBody>,
) -> Api<Snapshot> {
    let snapshot = state
        .manager
        .snapshot(&user.0, body.sandbox_id.as_deref(), &state.snapshots)
        .await?;
    Ok(Json(snapshot))
}

/// `POST /snapshot/restore`
pub async fn snapshot_restore(
    State(state): State<AppState>,
    user: UserId,
    Json(body): Json<SnapshotRestoreBody>,
) -> Api<OkResponse> {
    state
        .manager
        .restore(&user.0, &body.snapshot_id, &body.sandbox_id, &state.snapshots)
        .await?;
    Ok(Json(OkResponse::new()))
}

/// `GET /snapshot/list`
pub async fn snapshot_list(
    State(state): State<AppState>,
    user: UserId,
) -> Api<SnapshotListResponse> {
    let snapshots = state.snapshots.list(&user.0).await?;
    Ok(Json(SnapshotListResponse { snapshots }))
}

/// `DELETE /snapshot/{snapshot_id}`
pub async fn snapshot_delete(
    State(state): State<AppState>,
    user: UserId,
    Path(snapshot_id): Path<String>,
) -> Api<OkResponse> {
    state.snapshots.delete(&user.0, &snapshot_id).await?;
    Ok(Json(OkResponse::new()))
}

//--------------------------------------------------------------------------------------------------
// Functions: Preview Handlers
//--------------------------------------------------------------------------------------------------

/// `GET /previews`
pub async fn list_previews(State(state): State<AppState>) -> Api<Vec<PreviewTarget>> {
    Ok(Json(state.manager.list_previews()))
}

/// `ANY /preview/{sandbox_id}/{port}` — upstream root.
pub async fn proxy_root(
    State(state): State<AppState>,
    Path((sandbox_id, port)): Path<(String, u16)>,
    request: Request,
) -> Response {
    state
        .proxy
        .handle(sandbox_id, port, String::new(), request)
        .await
}

/// `ANY /preview/{sandbox_id}/{port}/{path}`
pub async fn proxy_path(
    State(state): State<AppState>,
    Path((sandbox_id, port, path)): Path<(String, u16, String)>,
    request: Request,
) -> Response {
    state.proxy.handle(sandbox_id, port, path, request).await
}

//--------------------------------------------------------------------------------------------------
// Functions: Operational Handlers
//--------------------------------------------------------------------------------------------------

/// `GET /health` — liveness.
pub async fn health() -> Json<OkResponse> {
    Json(OkResponse::new())
}

/// `GET /health/ready` — readiness: storage and isolation reachable.
pub async fn health_ready(State(state): State<AppState>) -> Result<Json<OkResponse>, ApiError> {
    state.storage.probe().await?;
    if !state.manager.driver().available().await {
        return Err(ApiError(CubicleError::PreconditionFailed(
            "isolation driver unavailable".to_string(),
        )));
    }
    Ok(Json(OkResponse::new()))
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let text = state.metrics.render()?;
    Ok(
        (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
    )
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Bridges a client WebSocket to a driver terminal stream.
async fn pump_terminal(socket: WebSocket, stream: DriverStream) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (mut socket_tx, mut socket_rx) = socket.split();

    let to_client = async {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket_tx
                        .send(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        let _ = socket_tx.close().await;
    };

    let to_sandbox = async {
        while let Some(Ok(message)) = socket_rx.next().await {
            let data = match message {
                Message::Binary(data) => data,
                Message::Text(text) => Bytes::from(text.to_string()),
                Message::Close(_) => break,
                _ => continue,
            };
            if writer.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    };

    tokio::join!(to_client, to_sandbox);
    debug!("terminal session closed");
}
