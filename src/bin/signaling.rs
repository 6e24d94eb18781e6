//! Media Signaling Plane binary (C4): WebRTC offer/answer/ICE rendezvous,
//! independent of the Orchestrator and any Simulation Agent pod.

use std::sync::Arc;

use cosim_core::config::Config;
use cosim_core::signaling::api::{router, SignalingApiState};
use cosim_core::signaling::RoomManager;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = Config::from_env();
    let rooms = Arc::new(RoomManager::new(config.signaling.room_grace));

    let addr: std::net::SocketAddr = std::env::var("SIGNALING_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8082".to_string()).parse()?;
    let app = router(SignalingApiState { rooms });
    info!(%addr, "signaling plane listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
