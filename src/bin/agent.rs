//! Simulation Agent binary (C3): one process per pod. Owns every session
//! scheduled onto it and serves the REST + WebSocket surface the
//! Orchestrator's pod address points subscribers at.

use std::sync::Arc;

use cosim_core::agent::api::{router, AgentApiState};
use cosim_core::agent::SimulationAgent;
use cosim_core::config::Config;
use cosim_core::external::InMemoryControlDocStore;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = Config::from_env();
    let agent = Arc::new(SimulationAgent::new(config.agent, config.sandbox, Arc::new(InMemoryControlDocStore::new())));

    let addr: std::net::SocketAddr = std::env::var("AGENT_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_string()).parse()?;
    let app = router(AgentApiState { agent });
    info!(%addr, "simulation agent listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
