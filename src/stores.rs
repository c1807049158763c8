//! Collaborator interfaces for the canonical and derived stores, plus the
//! in-memory implementation behind the `memory:` store URL.
//!
//! All writes are single-record upserts keyed by serial; no invariant spans
//! two records, so no transactions.

use crate::models::{DeviceAnalytics, DeviceRecord, SaleRecord, TelemetryPatch};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Canonical device registry (twin store).
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn list_serials(&self) -> Result<Vec<String>, StoreError>;

    async fn get(&self, serial: &str) -> Result<Option<DeviceRecord>, StoreError>;

    /// Merge the present fields into the twin and stamp `last_synced`.
    /// Returns the merged record, or `None` when no twin has this serial.
    async fn upsert_telemetry(
        &self,
        serial: &str,
        patch: &TelemetryPatch,
    ) -> Result<Option<DeviceRecord>, StoreError>;
}

/// Read-only join input owned by the external sales component.
#[async_trait]
pub trait SaleLookup: Send + Sync {
    async fn latest_for(&self, serial: &str) -> Result<Option<SaleRecord>, StoreError>;
}

/// Derived-record store; upsert is a full overwrite keyed by serial.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn upsert(&self, record: DeviceAnalytics) -> Result<(), StoreError>;

    async fn get(&self, serial: &str) -> Result<Option<DeviceAnalytics>, StoreError>;
}

/// One applied telemetry reading, kept for the analysis window.
#[derive(Debug, Clone)]
pub struct TelemetryReading {
    pub at: OffsetDateTime,
    pub cpu_usage: Option<u8>,
    pub temperature: Option<f64>,
}

const HISTORY_CAP: usize = 288;

/// In-process store for development and tests. Plays the role the devkit's
/// broker stub plays for MQTT: real trait surface, no external service.
#[derive(Default)]
pub struct InMemoryStore {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    sales: RwLock<HashMap<String, Vec<SaleRecord>>>,
    analytics: RwLock<HashMap<String, DeviceAnalytics>>,
    history: RwLock<HashMap<String, VecDeque<TelemetryReading>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration happens outside the core; tests and the demo seed use this.
    pub fn insert_device(&self, record: DeviceRecord) {
        self.devices
            .write()
            .insert(record.serial_number.clone(), record);
    }

    pub fn remove_device(&self, serial: &str) {
        self.devices.write().remove(serial);
    }

    pub fn record_sale(&self, sale: SaleRecord) {
        self.sales
            .write()
            .entry(sale.serial_number.clone())
            .or_default()
            .push(sale);
    }

    /// Recent readings for a serial, oldest first.
    pub fn recent_telemetry(&self, serial: &str, limit: usize) -> Vec<TelemetryReading> {
        self.history
            .read()
            .get(serial)
            .map(|h| h.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default()
    }

    fn push_history(&self, serial: &str, reading: TelemetryReading) {
        let mut history = self.history.write();
        let ring = history.entry(serial.to_string()).or_default();
        if ring.len() == HISTORY_CAP {
            ring.pop_front();
        }
        ring.push_back(reading);
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryStore {
    async fn list_serials(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.devices.read().keys().cloned().collect())
    }

    async fn get(&self, serial: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices.read().get(serial).cloned())
    }

    async fn upsert_telemetry(
        &self,
        serial: &str,
        patch: &TelemetryPatch,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        let merged = {
            let mut devices = self.devices.write();
            let Some(record) = devices.get_mut(serial) else {
                return Ok(None);
            };
            if let Some(cpu) = patch.cpu_usage {
                record.cpu_usage = cpu;
            }
            if let Some(temp) = patch.temperature {
                record.temperature = temp;
            }
            if let Some(battery) = patch.battery_health {
                record.battery_health = battery;
            }
            if let Some(charging) = patch.is_charging {
                record.is_charging = charging;
            }
            record.last_synced = Some(OffsetDateTime::now_utc());
            record.clone()
        };

        self.push_history(
            serial,
            TelemetryReading {
                at: merged.last_synced.unwrap_or_else(OffsetDateTime::now_utc),
                cpu_usage: patch.cpu_usage,
                temperature: patch.temperature,
            },
        );
        Ok(Some(merged))
    }
}

#[async_trait]
impl SaleLookup for InMemoryStore {
    async fn latest_for(&self, serial: &str) -> Result<Option<SaleRecord>, StoreError> {
        Ok(self.sales.read().get(serial).and_then(|sales| {
            sales
                .iter()
                .max_by_key(|s| s.sold_at)
                .cloned()
        }))
    }
}

#[async_trait]
impl AnalyticsStore for InMemoryStore {
    async fn upsert(&self, record: DeviceAnalytics) -> Result<(), StoreError> {
        self.analytics
            .write()
            .insert(record.serial_number.clone(), record);
        Ok(())
    }

    async fn get(&self, serial: &str) -> Result<Option<DeviceAnalytics>, StoreError> {
        Ok(self.analytics.read().get(serial).cloned())
    }
}
