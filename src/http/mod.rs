//! Control-plane surface: REST endpoints and the desktop stream.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::Agent;

pub mod rate_limit;
pub mod routes;
pub mod stream;

pub use routes::build_router;

/// Serve the control plane until `shutdown` fires.
///
/// TLS termination is the installer's collaborator; when no acceptor is
/// provisioned the listener speaks plain HTTP on the configured port.
pub async fn serve(
    agent: Arc<Agent>,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "control plane listening");

    let app = build_router(agent);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
