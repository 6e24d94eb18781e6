//! Session Orchestrator binary (C5). Loads `Config` from the environment,
//! constructs the in-process `Orchestrator`, serves its REST façade, and
//! drives the periodic scheduling/health/idle/quota/cost-guard sweep on
//! `ORCH_SCHEDULE_INTERVAL_MS`.

use std::sync::Arc;

use cosim_core::clock::SystemClock;
use cosim_core::config::Config;
use cosim_core::events::LoggingEventBus;
use cosim_core::orchestrator::api::{router, OrchestratorApiState};
use cosim_core::orchestrator::{NodePool, Orchestrator};
use tracing::info;

fn node_pools_from_env() -> Vec<NodePool> {
    vec![
        NodePool { name: "cpu-default".into(), has_gpu: false, gpu_class: None, spot_eligible: true, capacity: 64, load: 0 },
        NodePool { name: "gpu-t4".into(), has_gpu: true, gpu_class: Some("t4".into()), spot_eligible: false, capacity: 8, load: 0 },
        NodePool { name: "gpu-a10g".into(), has_gpu: true, gpu_class: Some("a10g".into()), spot_eligible: false, capacity: 4, load: 0 },
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = Config::from_env();
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        Arc::new(SystemClock),
        Arc::new(LoggingEventBus),
        node_pools_from_env(),
    ));

    let sweep = orchestrator.clone();
    let interval = config.orchestrator.schedule_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            sweep.tick(interval).await;
        }
    });

    let addr: std::net::SocketAddr = std::env::var("ORCH_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()).parse()?;
    let app = router(OrchestratorApiState { orchestrator });
    info!(%addr, "orchestrator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
