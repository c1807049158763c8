//! Pluggable analysis capability consumed by the analytics worker.
//!
//! The worker only sees the trait; the numeric internals are swappable. The
//! default implementation works off the in-memory telemetry history: anomaly
//! detection by temperature threshold, trend by cpu slope over the window.

use crate::models::{Anomaly, Forecast, UsageTrend};
use crate::stores::InMemoryStore;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Temperature above this is an anomalous reading.
pub const ANOMALY_TEMP_THRESHOLD: f64 = 40.0;
const WINDOW: usize = 120;
const TREND_EPSILON: f64 = 0.05;

#[async_trait]
pub trait AnalysisFunctions: Send + Sync {
    async fn anomalies(&self, serial: &str) -> Result<Vec<Anomaly>>;

    async fn forecast(&self, serial: &str) -> Result<Forecast>;
}

pub struct ThresholdAnalysis {
    store: Arc<InMemoryStore>,
}

impl ThresholdAnalysis {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AnalysisFunctions for ThresholdAnalysis {
    async fn anomalies(&self, serial: &str) -> Result<Vec<Anomaly>> {
        let readings = self.store.recent_telemetry(serial, WINDOW);
        let temps: Vec<(time::OffsetDateTime, f64)> = readings
            .iter()
            .filter_map(|r| r.temperature.map(|t| (r.at, t)))
            .collect();
        if temps.is_empty() {
            return Ok(Vec::new());
        }

        let n = temps.len() as f64;
        let mean = temps.iter().map(|(_, t)| t).sum::<f64>() / n;
        let variance = temps.iter().map(|(_, t)| (t - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        Ok(temps
            .into_iter()
            .filter(|(_, t)| *t > ANOMALY_TEMP_THRESHOLD)
            .map(|(at, t)| Anomaly {
                timestamp: at,
                temperature: t,
                z_score: if std_dev > 0.0 { (t - mean) / std_dev } else { 0.0 },
                kind: "temperature_spike".to_string(),
            })
            .collect())
    }

    async fn forecast(&self, serial: &str) -> Result<Forecast> {
        let readings = self.store.recent_telemetry(serial, WINDOW);
        let loads: Vec<f64> = readings
            .iter()
            .filter_map(|r| r.cpu_usage.map(f64::from))
            .collect();
        if loads.len() < 2 {
            return Ok(Forecast {
                trend: UsageTrend::Stable,
                slope: 0.0,
            });
        }

        // Least-squares slope of cpu over the window index.
        let n = loads.len() as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = loads.iter().sum::<f64>() / n;
        let mut cov = 0.0;
        let mut var_x = 0.0;
        for (i, y) in loads.iter().enumerate() {
            let dx = i as f64 - mean_x;
            cov += dx * (y - mean_y);
            var_x += dx * dx;
        }
        let slope = if var_x > 0.0 { cov / var_x } else { 0.0 };

        let trend = if slope > TREND_EPSILON {
            UsageTrend::Rising
        } else if slope < -TREND_EPSILON {
            UsageTrend::Falling
        } else {
            UsageTrend::Stable
        };
        Ok(Forecast { trend, slope })
    }
}
