//! Canonical entities and broker wire shapes for the fleet pipeline.
//!
//! Every payload crossing the broker is a strict serde struct: required keys
//! missing means the message is malformed and gets dropped, optional telemetry
//! fields absent mean "unchanged".

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Canonical twin state of one simulated device.
///
/// Created by registration (outside this core); mutated only by the telemetry
/// consumer; read by the simulation supervisor to size its simulator set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub serial_number: String,
    pub cpu_usage: u8,
    pub temperature: f64,
    pub battery_health: u8,
    pub is_charging: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_synced: Option<OffsetDateTime>,
}

impl DeviceRecord {
    /// Fresh twin as registration would create it.
    pub fn new(serial_number: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            serial_number: serial_number.into(),
            cpu_usage: 0,
            temperature: 25.0,
            battery_health: 100,
            is_charging: false,
            last_synced: None,
        }
    }
}

/// The optional field set shared by telemetry events and push payloads.
/// Absent field = leave the canonical value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_health: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_charging: Option<bool>,
}

impl TelemetryPatch {
    pub fn is_empty(&self) -> bool {
        self.cpu_usage.is_none()
            && self.temperature.is_none()
            && self.battery_health.is_none()
            && self.is_charging.is_none()
    }
}

/// One simulator tick on the `telemetry_updates` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub serial_number: String,
    #[serde(flatten)]
    pub patch: TelemetryPatch,
}

/// Remote actuation request on the `device_commands` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub target_serial: String,
    pub action: String,
    #[serde(rename = "timestamp", with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

/// Only action with defined behavior; everything else is ignored.
pub const ACTION_RUN_DIAGNOSTICS: &str = "RUN_DIAGNOSTICS";

/// One unit of analytics work on the `analytics_jobs` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsJob {
    pub serial_number: String,
}

/// Single anomalous telemetry reading, as reported by the analysis functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub temperature: f64,
    pub z_score: f64,
    pub kind: String,
}

/// Direction of the usage forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageTrend {
    Rising,
    Falling,
    Stable,
}

impl std::fmt::Display for UsageTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UsageTrend::Rising => "rising",
            UsageTrend::Falling => "falling",
            UsageTrend::Stable => "stable",
        };
        f.write_str(s)
    }
}

/// Trend forecast returned by the analysis functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub trend: UsageTrend,
    pub slope: f64,
}

/// Derived risk record, fully overwritten on every analytics cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAnalytics {
    pub serial_number: String,
    /// Always clamped to [0,100].
    pub health_score: u8,
    pub usage_trend: UsageTrend,
    pub anomalies: Vec<Anomaly>,
    pub revenue_at_risk: Option<f64>,
    pub return_risk_flag: Option<bool>,
    pub days_since_sale: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_analyzed: OffsetDateTime,
}

/// Sale joined into the analytics record; owned by the sales component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleRecord {
    pub serial_number: String,
    pub price: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub sold_at: OffsetDateTime,
}

/// Real-time `telemetry_update` push payload: merged fields + record id.
#[derive(Debug, Clone, Serialize)]
pub struct PushEvent {
    pub id: Uuid,
    pub serial_number: String,
    #[serde(flatten)]
    pub fields: TelemetryPatch,
    #[serde(with = "time::serde::rfc3339")]
    pub last_synced: OffsetDateTime,
}
