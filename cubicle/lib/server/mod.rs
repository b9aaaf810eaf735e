//! The HTTP façade over the sandbox runtime, snapshot engine, and preview
//! proxy.

pub mod data;
pub mod handlers;
mod middleware;
mod routes;
mod state;

use std::net::SocketAddr;

use tracing::info;

use crate::CubicleResult;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use routes::*;
pub use state::*;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Serves the API until ctrl-c.
pub async fn serve(state: AppState, addr: SocketAddr) -> CubicleResult<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control plane listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
