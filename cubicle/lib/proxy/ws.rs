//! WebSocket bridging between a client and an in-sandbox upstream.

use axum::extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{tungstenite::Message as UpstreamMessage, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::CubicleError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An established upstream WebSocket connection.
pub(crate) type UpstreamSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Dials the upstream WebSocket.
///
/// The dial happens before the client upgrade completes so a dead upstream
/// surfaces as an HTTP error the caller can feed into the failure budget.
pub(crate) async fn connect(url: &str) -> Result<UpstreamSocket, CubicleError> {
    let (upstream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| CubicleError::Upstream(format!("websocket dial {}: {}", url, e)))?;
    Ok(upstream)
}

/// Completes the client upgrade and pumps frames both ways.
pub(crate) fn bridge(upgrade: WebSocketUpgrade, upstream: UpstreamSocket) -> Response {
    upgrade.on_upgrade(move |client| pump(client, upstream))
}

/// Pumps frames both directions until either side closes.
async fn pump(client: WebSocket, upstream: UpstreamSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let outbound = match message {
                ClientMessage::Text(text) => UpstreamMessage::text(text.to_string()),
                ClientMessage::Binary(data) => UpstreamMessage::binary(data.to_vec()),
                ClientMessage::Ping(data) => UpstreamMessage::Ping(data.to_vec().into()),
                ClientMessage::Pong(data) => UpstreamMessage::Pong(data.to_vec().into()),
                ClientMessage::Close(_) => break,
            };
            if upstream_tx.send(outbound).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let inbound = match message {
                UpstreamMessage::Text(text) => ClientMessage::Text(text.to_string().into()),
                UpstreamMessage::Binary(data) => ClientMessage::Binary(data.to_vec().into()),
                UpstreamMessage::Ping(data) => ClientMessage::Ping(data.to_vec().into()),
                UpstreamMessage::Pong(data) => ClientMessage::Pong(data.to_vec().into()),
                UpstreamMessage::Close(_) => break,
                UpstreamMessage::Frame(_) => continue,
            };
            if client_tx.send(inbound).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(to_upstream, to_client);
    debug!("websocket bridge closed");
}
