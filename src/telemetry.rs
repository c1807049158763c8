//! Telemetry consumer: merges events into canonical twin state and fans the
//! merged fields out to every connected observer.

use crate::broker::{BrokerGateway, Subscription, TELEMETRY_QUEUE};
use crate::error::PipelineError;
use crate::models::{PushEvent, TelemetryEvent};
use crate::stores::DeviceRegistry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Fan-out hub for real-time `telemetry_update` events. Every observer gets
/// every event; there is no per-client filtering.
#[derive(Clone)]
pub struct PushHub {
    tx: broadcast::Sender<PushEvent>,
}

impl PushHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn broadcast(&self, event: PushEvent) {
        // No observers connected is not an error.
        let _ = self.tx.send(event);
    }
}

pub struct TelemetryConsumer {
    registry: Arc<dyn DeviceRegistry>,
    push: PushHub,
}

impl TelemetryConsumer {
    pub fn new(registry: Arc<dyn DeviceRegistry>, push: PushHub) -> Self {
        Self { registry, push }
    }

    /// Merge one event into the twin and push the merged fields.
    ///
    /// Empty field sets and unknown serials are silent no-ops; a push happens
    /// only when the merge touched at least one field.
    pub async fn apply(&self, event: TelemetryEvent) -> Result<Option<PushEvent>, PipelineError> {
        if event.patch.is_empty() {
            debug!(serial = %event.serial_number, "event carried no fields, skipping");
            return Ok(None);
        }

        let Some(record) = self
            .registry
            .upsert_telemetry(&event.serial_number, &event.patch)
            .await?
        else {
            debug!(serial = %event.serial_number, "no twin for serial, skipping");
            return Ok(None);
        };

        let push = PushEvent {
            id: record.id,
            serial_number: record.serial_number,
            fields: event.patch,
            last_synced: record
                .last_synced
                .unwrap_or_else(time::OffsetDateTime::now_utc),
        };
        self.push.broadcast(push.clone());
        Ok(Some(push))
    }

    /// Wire the consumer to the telemetry queue. Per-message errors are
    /// logged and scoped to that message; the loop never stalls.
    pub async fn start(
        self: Arc<Self>,
        gateway: &BrokerGateway,
    ) -> Result<Subscription, PipelineError> {
        gateway
            .consume(TELEMETRY_QUEUE, move |payload: Vec<u8>| {
                let consumer = self.clone();
                async move {
                    let event: TelemetryEvent = serde_json::from_slice(&payload)
                        .map_err(|e| PipelineError::malformed(TELEMETRY_QUEUE, e))?;
                    let serial = event.serial_number.clone();
                    match consumer.apply(event).await {
                        Ok(_) => Ok(()),
                        Err(e) => {
                            warn!(serial = %serial, error = %e, "telemetry apply failed");
                            Ok(())
                        }
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceRecord, TelemetryPatch};
    use crate::stores::InMemoryStore;

    fn consumer_with(store: Arc<InMemoryStore>) -> TelemetryConsumer {
        TelemetryConsumer::new(store, PushHub::new(16))
    }

    #[tokio::test]
    async fn partial_event_leaves_other_fields_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let mut twin = DeviceRecord::new("QX1");
        twin.temperature = 33.0;
        twin.battery_health = 80;
        store.insert_device(twin);

        let consumer = consumer_with(store.clone());
        let pushed = consumer
            .apply(TelemetryEvent {
                serial_number: "QX1".into(),
                patch: TelemetryPatch {
                    cpu_usage: Some(55),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert!(pushed.is_some());

        let twin = crate::stores::DeviceRegistry::get(store.as_ref(), "QX1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(twin.cpu_usage, 55);
        assert_eq!(twin.temperature, 33.0);
        assert_eq!(twin.battery_health, 80);
        assert!(twin.last_synced.is_some());
    }

    #[tokio::test]
    async fn empty_patch_is_a_noop() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_device(DeviceRecord::new("QX1"));
        let consumer = consumer_with(store.clone());

        let pushed = consumer
            .apply(TelemetryEvent {
                serial_number: "QX1".into(),
                patch: TelemetryPatch::default(),
            })
            .await
            .unwrap();
        assert!(pushed.is_none());

        let twin = crate::stores::DeviceRegistry::get(store.as_ref(), "QX1")
            .await
            .unwrap()
            .unwrap();
        assert!(twin.last_synced.is_none(), "no merge, no sync stamp");
    }

    #[tokio::test]
    async fn unknown_serial_produces_no_push() {
        let store = Arc::new(InMemoryStore::new());
        let consumer = consumer_with(store);
        let pushed = consumer
            .apply(TelemetryEvent {
                serial_number: "ghost".into(),
                patch: TelemetryPatch {
                    temperature: Some(50.0),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert!(pushed.is_none());
    }

    #[tokio::test]
    async fn push_event_carries_record_id_and_merged_fields() {
        let store = Arc::new(InMemoryStore::new());
        let twin = DeviceRecord::new("QX1");
        let twin_id = twin.id;
        store.insert_device(twin);

        let consumer = consumer_with(store);
        let mut rx = consumer.push.subscribe();

        consumer
            .apply(TelemetryEvent {
                serial_number: "QX1".into(),
                patch: TelemetryPatch {
                    temperature: Some(41.5),
                    is_charging: Some(true),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.id, twin_id);
        assert_eq!(ev.serial_number, "QX1");
        assert_eq!(ev.fields.temperature, Some(41.5));
        assert_eq!(ev.fields.is_charging, Some(true));
        assert_eq!(ev.fields.cpu_usage, None);
    }
}
