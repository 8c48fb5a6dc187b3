use anyhow::Result;
use microgrid_coordinator::{config, simulation, telemetry};
use config::Config;
use simulation::Microgrid;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{init_tracing, shutdown_signal, EventSink, TracingSink};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;
    init_tracing(&cfg.telemetry);

    if cfg.sim.replicas_per_load < 3 {
        warn!(
            replicas = cfg.sim.replicas_per_load,
            "fewer than three replicas per load, consensus voting is disabled"
        );
    }

    info!(
        strategy = ?cfg.optimizer.strategy,
        replicas_per_load = cfg.sim.replicas_per_load,
        cycle_ms = cfg.sim.cycle_ms,
        "starting microgrid coordinator"
    );

    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let (mut grid, mut reports) = Microgrid::start(&cfg, sink)?;

    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.sim.cycle_ms));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => grid.tick()?,
            Some(report) = reports.recv() => {
                info!(
                    cycle = report.cycle,
                    status = ?report.status,
                    fallback = report.fallback,
                    projected_soc = report.battery.as_ref().map(|b| b.projected_final_soc),
                    battery_soc = grid.battery_soc(),
                    "dispatch cycle complete"
                );
                if let Ok(json) = serde_json::to_string(&report) {
                    tracing::debug!(report = %json, "cycle report");
                }
            }
        }
    }

    grid.shutdown();
    warn!("shutdown complete");
    Ok(())
}
