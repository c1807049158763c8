//! Process bootstrap: config, stores, broker gateway, and the five long
//! running tasks (simulation loop, telemetry consumer, analytics scheduler,
//! analytics worker, observer HTTP surface), with cooperative shutdown.

use anyhow::Context;
use fleetwin::analysis::ThresholdAnalysis;
use fleetwin::analytics::{AnalyticsScheduler, AnalyticsWorker};
use fleetwin::broker::BrokerGateway;
use fleetwin::config::Config;
use fleetwin::http::{self, AppState};
use fleetwin::models::DeviceRecord;
use fleetwin::stores::InMemoryStore;
use fleetwin::supervisor::SimulationSupervisor;
use fleetwin::telemetry::{PushHub, TelemetryConsumer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Configuration errors are the only fatal startup path.
    let cfg = Config::from_env().context("refusing to start")?;
    if cfg.store_url != "memory:" {
        anyhow::bail!(
            "unsupported store url '{}': only 'memory:' is wired in this build",
            cfg.store_url
        );
    }

    let store = Arc::new(InMemoryStore::new());
    for serial in &cfg.seed_devices {
        info!(serial = %serial, "seeding demo twin");
        store.insert_device(DeviceRecord::new(serial.clone()));
    }

    let gateway = Arc::new(BrokerGateway::new(cfg.broker.clone()));
    let push = PushHub::new(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Arc::new(SimulationSupervisor::new(store.clone(), cfg.tick_interval));
    let supervisor_task = tokio::spawn(supervisor.run(gateway.clone(), shutdown_rx.clone()));

    let consumer = Arc::new(TelemetryConsumer::new(store.clone(), push.clone()));
    let telemetry_sub = consumer.start(&gateway).await?;

    let analysis = Arc::new(ThresholdAnalysis::new(store.clone()));
    let worker = Arc::new(AnalyticsWorker::new(
        store.clone(),
        store.clone(),
        store.clone(),
        analysis,
    ));
    let worker_sub = worker.start(&gateway).await?;

    let scheduler = AnalyticsScheduler::new(store.clone(), cfg.scheduler_interval);
    let scheduler_task = tokio::spawn(scheduler.run(gateway.clone(), shutdown_rx.clone()));

    let http_state = AppState {
        registry: store.clone(),
        push: push.clone(),
        started: Instant::now(),
    };
    let http_task = tokio::spawn(http::serve(http_state, cfg.http_port, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    // Bounded grace period for the loops to drain, then drop the broker.
    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = supervisor_task.await;
        let _ = scheduler_task.await;
        let _ = http_task.await;
    })
    .await
    .is_err()
    {
        error!("tasks did not drain within grace period");
    }
    telemetry_sub.cancel();
    worker_sub.cancel();
    gateway.disconnect().await;
    info!("fleetwin stopped");
    Ok(())
}
