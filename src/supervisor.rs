//! Simulation supervisor: owns the live simulator set, keeps it in sync with
//! the device registry, drives the tick loop, and routes remote commands.
//!
//! Sole publisher of telemetry and sole consumer of the command queue, so
//! per-device event order matches tick order.

use crate::broker::{BrokerGateway, Subscription, COMMANDS_QUEUE, RECONNECT_DELAY, TELEMETRY_QUEUE};
use crate::error::PipelineError;
use crate::models::{Command, TelemetryEvent};
use crate::simulator::{DeviceSimulator, DriftModel};
use crate::state::{new_state, Shared};
use crate::stores::DeviceRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct SimulationSupervisor {
    registry: Arc<dyn DeviceRegistry>,
    simulators: Shared<HashMap<String, DeviceSimulator>>,
    model: Arc<DriftModel>,
    tick_interval: Duration,
}

impl SimulationSupervisor {
    pub fn new(registry: Arc<dyn DeviceRegistry>, tick_interval: Duration) -> Self {
        Self {
            registry,
            simulators: new_state(HashMap::new()),
            // One model instance, shared read-only by every simulator.
            model: Arc::new(DriftModel::default()),
            tick_interval,
        }
    }

    /// Add simulators for newly registered devices, drop simulators for
    /// removed ones. At most one live simulator per serial.
    pub async fn sync_simulators(&self) -> Result<(), PipelineError> {
        let serials = self.registry.list_serials().await?;
        let mut sims = self.simulators.lock();

        for serial in &serials {
            if !sims.contains_key(serial) {
                debug!(serial = %serial, "starting simulator");
                sims.insert(
                    serial.clone(),
                    DeviceSimulator::new(serial.clone(), self.model.clone()),
                );
            }
        }
        // Discard simulators for deleted twins so the set never grows
        // unbounded.
        sims.retain(|serial, _| serials.iter().any(|s| s == serial));
        Ok(())
    }

    /// Advance every simulator one tick; idle ones emit nothing.
    pub fn tick(&self) -> Vec<TelemetryEvent> {
        let mut sims = self.simulators.lock();
        sims.values_mut().filter_map(DeviceSimulator::update).collect()
    }

    /// Route a command to its target simulator. Unknown serials have no
    /// simulator to route to and are silently dropped.
    pub fn handle_command(&self, command: Command) {
        let mut sims = self.simulators.lock();
        match sims.get_mut(&command.target_serial) {
            Some(sim) => {
                info!(serial = %command.target_serial, action = %command.action, "stimulating hardware");
                sim.trigger(&command.action);
            }
            None => debug!(serial = %command.target_serial, "command for unknown serial, dropped"),
        }
    }

    pub fn simulator_count(&self) -> usize {
        self.simulators.lock().len()
    }

    async fn step(&self, gateway: &BrokerGateway) -> Result<(), PipelineError> {
        self.sync_simulators().await?;
        for event in self.tick() {
            gateway.publish(TELEMETRY_QUEUE, &event).await?;
        }
        Ok(())
    }

    /// Tick loop plus the command subscription. Never exits on error: any
    /// failed pass is logged, the loop pauses the fixed backoff, then
    /// resumes. Only the shutdown signal ends it.
    pub async fn run(
        self: Arc<Self>,
        gateway: Arc<BrokerGateway>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let command_sub = self.clone().subscribe_commands(&gateway).await?;

        let mut ticker = tokio::time::interval(self.tick_interval);
        info!(interval_secs = self.tick_interval.as_secs(), "simulation loop started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.step(&gateway).await {
                        error!(error = %e, "simulation pass failed, pausing");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        }

        info!("simulation loop stopped");
        command_sub.cancel();
        Ok(())
    }

    async fn subscribe_commands(
        self: Arc<Self>,
        gateway: &BrokerGateway,
    ) -> Result<Subscription, PipelineError> {
        gateway
            .consume(COMMANDS_QUEUE, move |payload: Vec<u8>| {
                let supervisor = self.clone();
                async move {
                    let command: Command = serde_json::from_slice(&payload)
                        .map_err(|e| PipelineError::malformed(COMMANDS_QUEUE, e))?;
                    supervisor.handle_command(command);
                    Ok(())
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceRecord, ACTION_RUN_DIAGNOSTICS};
    use crate::stores::InMemoryStore;
    use time::OffsetDateTime;

    fn command(serial: &str, action: &str) -> Command {
        Command {
            target_serial: serial.into(),
            action: action.into(),
            issued_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn sync_adds_and_removes_simulators() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(DeviceRecord::new("QX1"));
        store.insert_device(DeviceRecord::new("QX2"));

        let sup = SimulationSupervisor::new(store.clone(), Duration::from_secs(2));
        sup.sync_simulators().await.unwrap();
        assert_eq!(sup.simulator_count(), 2);

        store.remove_device("QX2");
        sup.sync_simulators().await.unwrap();
        assert_eq!(sup.simulator_count(), 1);

        // Re-sync without registry changes keeps the set stable.
        sup.sync_simulators().await.unwrap();
        assert_eq!(sup.simulator_count(), 1);
    }

    #[tokio::test]
    async fn idle_fleet_emits_no_telemetry() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(DeviceRecord::new("QX1"));
        let sup = SimulationSupervisor::new(store, Duration::from_secs(2));
        sup.sync_simulators().await.unwrap();

        assert!(sup.tick().is_empty());
    }

    #[tokio::test]
    async fn diagnostics_command_activates_target_only() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(DeviceRecord::new("QX1"));
        store.insert_device(DeviceRecord::new("QX2"));
        let sup = SimulationSupervisor::new(store, Duration::from_secs(2));
        sup.sync_simulators().await.unwrap();

        sup.handle_command(command("QX1", ACTION_RUN_DIAGNOSTICS));

        let events = sup.tick();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].serial_number, "QX1");
        let cpu = events[0].patch.cpu_usage.unwrap();
        assert!((85..=100).contains(&cpu));
        assert!(events[0].patch.temperature.unwrap() > 25.0);
    }

    #[tokio::test]
    async fn command_for_unknown_serial_changes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(DeviceRecord::new("QX1"));
        let sup = SimulationSupervisor::new(store, Duration::from_secs(2));
        sup.sync_simulators().await.unwrap();

        sup.handle_command(command("ghost", ACTION_RUN_DIAGNOSTICS));
        assert!(sup.tick().is_empty());
    }

    #[tokio::test]
    async fn burst_then_cooldown_scenario() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(DeviceRecord::new("QX1"));
        let sup = SimulationSupervisor::new(store, Duration::from_secs(2));
        sup.sync_simulators().await.unwrap();

        sup.handle_command(command("QX1", ACTION_RUN_DIAGNOSTICS));

        // Six ticks: burst band cpu, elevated temperature.
        let mut last_burst_cpu = 0;
        for _ in 0..6 {
            let events = sup.tick();
            if let Some(ev) = events.first() {
                let cpu = ev.patch.cpu_usage.unwrap();
                if ev.patch.temperature.unwrap() > 25.0 && (85..=100).contains(&cpu) {
                    last_burst_cpu = cpu;
                }
            }
        }
        assert!(last_burst_cpu >= 85);

        // Five more: cpu trending toward zero, then idle.
        let mut final_cpu = u8::MAX;
        for _ in 0..5 {
            if let Some(ev) = sup.tick().into_iter().next() {
                final_cpu = ev.patch.cpu_usage.unwrap();
            }
        }
        assert!(final_cpu < 85, "cooldown should pull cpu down, got {final_cpu}");
        assert!(sup.tick().is_empty(), "run exhausted, back to idle");
    }
}
