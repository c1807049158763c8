//! Analytics scheduler and worker.
//!
//! The scheduler enqueues one job per registered device on a fixed interval,
//! with no deduplication: the worker's write is an idempotent full-overwrite
//! upsert, so duplicate jobs just redo the computation.

use crate::analysis::AnalysisFunctions;
use crate::broker::{BrokerGateway, Subscription, ANALYTICS_QUEUE, RECONNECT_DELAY};
use crate::error::PipelineError;
use crate::models::{AnalyticsJob, DeviceAnalytics, UsageTrend};
use crate::stores::{AnalyticsStore, DeviceRegistry, SaleLookup};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const ANOMALY_PENALTY: i64 = 5;
const RISK_SCORE_CEILING: u8 = 40;
const RISK_WINDOW_DAYS: i64 = 365;

pub struct AnalyticsScheduler {
    registry: Arc<dyn DeviceRegistry>,
    interval: Duration,
}

impl AnalyticsScheduler {
    pub fn new(registry: Arc<dyn DeviceRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// One job per active device serial.
    pub async fn collect_jobs(&self) -> Result<Vec<AnalyticsJob>, PipelineError> {
        let serials = self.registry.list_serials().await?;
        Ok(serials
            .into_iter()
            .map(|serial_number| AnalyticsJob { serial_number })
            .collect())
    }

    pub async fn run(
        self,
        gateway: Arc<BrokerGateway>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "analytics scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.enqueue_cycle(&gateway).await {
                        Ok(count) if count > 0 => debug!(jobs = count, "analytics cycle enqueued"),
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "analytics scheduling failed, pausing");
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }

        info!("analytics scheduler stopped");
        Ok(())
    }

    async fn enqueue_cycle(&self, gateway: &BrokerGateway) -> Result<usize, PipelineError> {
        let jobs = self.collect_jobs().await?;
        let count = jobs.len();
        for job in jobs {
            gateway.publish(ANALYTICS_QUEUE, &job).await?;
        }
        Ok(count)
    }
}

pub struct AnalyticsWorker {
    registry: Arc<dyn DeviceRegistry>,
    sales: Arc<dyn SaleLookup>,
    store: Arc<dyn AnalyticsStore>,
    analysis: Arc<dyn AnalysisFunctions>,
}

impl AnalyticsWorker {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        sales: Arc<dyn SaleLookup>,
        store: Arc<dyn AnalyticsStore>,
        analysis: Arc<dyn AnalysisFunctions>,
    ) -> Self {
        Self {
            registry,
            sales,
            store,
            analysis,
        }
    }

    /// Compute and upsert the full risk record for one device.
    pub async fn process_job(&self, job: AnalyticsJob) -> Result<DeviceAnalytics, PipelineError> {
        let serial = &job.serial_number;

        let anomalies = self
            .analysis
            .anomalies(serial)
            .await
            .map_err(PipelineError::Analysis)?;

        // Forecast failure is soft: the trend just falls back to stable.
        let trend = match self.analysis.forecast(serial).await {
            Ok(forecast) => forecast.trend,
            Err(e) => {
                warn!(serial = %serial, error = %e, "forecast unavailable, defaulting to stable");
                UsageTrend::Stable
            }
        };

        let battery_health = self
            .registry
            .get(serial)
            .await?
            .map(|twin| i64::from(twin.battery_health))
            .unwrap_or(100);
        let health_score =
            (battery_health - ANOMALY_PENALTY * anomalies.len() as i64).clamp(0, 100) as u8;

        let now = OffsetDateTime::now_utc();
        let (revenue_at_risk, return_risk_flag, days_since_sale) =
            match self.sales.latest_for(serial).await? {
                Some(sale) => {
                    let days = (now - sale.sold_at).whole_days();
                    let at_risk = round2(sale.price * (1.0 - f64::from(health_score) / 100.0));
                    let flagged = health_score < RISK_SCORE_CEILING && days < RISK_WINDOW_DAYS;
                    (Some(at_risk), Some(flagged), Some(days))
                }
                None => (None, None, None),
            };

        let record = DeviceAnalytics {
            serial_number: serial.clone(),
            health_score,
            usage_trend: trend,
            anomalies,
            revenue_at_risk,
            return_risk_flag,
            days_since_sale,
            last_analyzed: now,
        };
        self.store.upsert(record.clone()).await?;
        debug!(serial = %serial, health_score, "analytics record upserted");
        Ok(record)
    }

    /// Bind the worker to the job queue. Broker-side prefetch keeps one job
    /// in flight per worker; scale-out is more worker instances on the same
    /// durable queue.
    pub async fn start(
        self: Arc<Self>,
        gateway: &BrokerGateway,
    ) -> Result<Subscription, PipelineError> {
        gateway
            .consume(ANALYTICS_QUEUE, move |payload: Vec<u8>| {
                let worker = self.clone();
                async move {
                    let job: AnalyticsJob = serde_json::from_slice(&payload)
                        .map_err(|e| PipelineError::malformed(ANALYTICS_QUEUE, e))?;
                    let serial = job.serial_number.clone();
                    if let Err(e) = worker.process_job(job).await {
                        // Abandon this job only; the loop moves on.
                        warn!(serial = %serial, error = %e, "analytics job failed");
                    }
                    Ok(())
                }
            })
            .await
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Anomaly, DeviceRecord, Forecast, SaleRecord};
    use crate::stores::InMemoryStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use time::Duration as TimeDuration;

    struct FixedAnalysis {
        anomaly_count: usize,
        forecast: Option<Forecast>,
    }

    #[async_trait]
    impl AnalysisFunctions for FixedAnalysis {
        async fn anomalies(&self, _serial: &str) -> anyhow::Result<Vec<Anomaly>> {
            Ok((0..self.anomaly_count)
                .map(|i| Anomaly {
                    timestamp: OffsetDateTime::now_utc(),
                    temperature: 45.0 + i as f64,
                    z_score: 2.0,
                    kind: "temperature_spike".into(),
                })
                .collect())
        }

        async fn forecast(&self, _serial: &str) -> anyhow::Result<Forecast> {
            self.forecast
                .clone()
                .ok_or_else(|| anyhow!("model not trained"))
        }
    }

    fn worker(store: Arc<InMemoryStore>, analysis: FixedAnalysis) -> AnalyticsWorker {
        AnalyticsWorker::new(store.clone(), store.clone(), store, Arc::new(analysis))
    }

    fn job(serial: &str) -> AnalyticsJob {
        AnalyticsJob {
            serial_number: serial.into(),
        }
    }

    #[tokio::test]
    async fn health_score_penalizes_anomalies() {
        let store = Arc::new(InMemoryStore::new());
        let mut twin = DeviceRecord::new("QX1");
        twin.battery_health = 80;
        store.insert_device(twin);

        let worker = worker(
            store,
            FixedAnalysis {
                anomaly_count: 3,
                forecast: Some(Forecast {
                    trend: UsageTrend::Rising,
                    slope: 1.0,
                }),
            },
        );
        let record = worker.process_job(job("QX1")).await.unwrap();
        assert_eq!(record.health_score, 65);
        assert_eq!(record.usage_trend, UsageTrend::Rising);
        assert_eq!(record.anomalies.len(), 3);
    }

    #[tokio::test]
    async fn health_score_clamps_at_zero() {
        let store = Arc::new(InMemoryStore::new());
        let mut twin = DeviceRecord::new("QX1");
        twin.battery_health = 10;
        store.insert_device(twin);

        let worker = worker(
            store,
            FixedAnalysis {
                anomaly_count: 20,
                forecast: None,
            },
        );
        let record = worker.process_job(job("QX1")).await.unwrap();
        assert_eq!(record.health_score, 0);
    }

    #[tokio::test]
    async fn missing_twin_defaults_battery_to_100() {
        let store = Arc::new(InMemoryStore::new());
        let worker = worker(
            store,
            FixedAnalysis {
                anomaly_count: 2,
                forecast: None,
            },
        );
        let record = worker.process_job(job("never-registered")).await.unwrap();
        assert_eq!(record.health_score, 90);
    }

    #[tokio::test]
    async fn forecast_error_defaults_to_stable() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(DeviceRecord::new("QX1"));
        let worker = worker(
            store,
            FixedAnalysis {
                anomaly_count: 0,
                forecast: None,
            },
        );
        let record = worker.process_job(job("QX1")).await.unwrap();
        assert_eq!(record.usage_trend, UsageTrend::Stable);
    }

    #[tokio::test]
    async fn no_sale_means_no_financial_fields() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(DeviceRecord::new("QX1"));
        let worker = worker(
            store,
            FixedAnalysis {
                anomaly_count: 0,
                forecast: None,
            },
        );
        let record = worker.process_job(job("QX1")).await.unwrap();
        assert_eq!(record.revenue_at_risk, None);
        assert_eq!(record.return_risk_flag, None);
        assert_eq!(record.days_since_sale, None);
    }

    #[tokio::test]
    async fn sale_join_derives_financial_risk() {
        let store = Arc::new(InMemoryStore::new());
        let mut twin = DeviceRecord::new("QX1");
        twin.battery_health = 70;
        store.insert_device(twin);
        store.record_sale(SaleRecord {
            serial_number: "QX1".into(),
            price: 999.99,
            sold_at: OffsetDateTime::now_utc() - TimeDuration::days(100),
        });

        let worker = worker(
            store,
            FixedAnalysis {
                anomaly_count: 8,
                forecast: None,
            },
        );
        let record = worker.process_job(job("QX1")).await.unwrap();
        // 70 - 8*5 = 30
        assert_eq!(record.health_score, 30);
        assert_eq!(record.days_since_sale, Some(100));
        assert_eq!(record.revenue_at_risk, Some(round2(999.99 * 0.7)));
        assert_eq!(record.return_risk_flag, Some(true));
    }

    #[tokio::test]
    async fn old_sale_is_not_return_risk() {
        let store = Arc::new(InMemoryStore::new());
        let mut twin = DeviceRecord::new("QX1");
        twin.battery_health = 20;
        store.insert_device(twin);
        store.record_sale(SaleRecord {
            serial_number: "QX1".into(),
            price: 500.0,
            sold_at: OffsetDateTime::now_utc() - TimeDuration::days(400),
        });

        let worker = worker(
            store,
            FixedAnalysis {
                anomaly_count: 0,
                forecast: None,
            },
        );
        let record = worker.process_job(job("QX1")).await.unwrap();
        assert_eq!(record.days_since_sale, Some(400));
        assert_eq!(record.return_risk_flag, Some(false));
    }

    #[tokio::test]
    async fn reprocessing_is_idempotent_apart_from_timestamp() {
        let store = Arc::new(InMemoryStore::new());
        let mut twin = DeviceRecord::new("QX1");
        twin.battery_health = 55;
        store.insert_device(twin);
        store.record_sale(SaleRecord {
            serial_number: "QX1".into(),
            price: 250.0,
            sold_at: OffsetDateTime::now_utc() - TimeDuration::days(30),
        });

        let worker = worker(
            store.clone(),
            FixedAnalysis {
                anomaly_count: 1,
                forecast: Some(Forecast {
                    trend: UsageTrend::Falling,
                    slope: -0.5,
                }),
            },
        );
        let first = worker.process_job(job("QX1")).await.unwrap();
        let second = worker.process_job(job("QX1")).await.unwrap();

        assert_eq!(first.health_score, second.health_score);
        assert_eq!(first.usage_trend, second.usage_trend);
        assert_eq!(first.revenue_at_risk, second.revenue_at_risk);
        assert_eq!(first.return_risk_flag, second.return_risk_flag);
        assert_eq!(first.days_since_sale, second.days_since_sale);

        // Store holds the latest full overwrite.
        let stored = AnalyticsStore::get(store.as_ref(), "QX1").await.unwrap().unwrap();
        assert_eq!(stored.last_analyzed, second.last_analyzed);
    }

    #[tokio::test]
    async fn scheduler_emits_one_job_per_serial() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(DeviceRecord::new("QX1"));
        store.insert_device(DeviceRecord::new("QX2"));
        store.insert_device(DeviceRecord::new("QX3"));

        let scheduler = AnalyticsScheduler::new(store, Duration::from_secs(60));
        let mut jobs = scheduler.collect_jobs().await.unwrap();
        jobs.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));
        let serials: Vec<_> = jobs.iter().map(|j| j.serial_number.as_str()).collect();
        assert_eq!(serials, ["QX1", "QX2", "QX3"]);
    }
}
