//! Resilient broker connection layer.
//!
//! One lazily-established MQTT connection per gateway, guarded by an async
//! mutex so concurrent callers never race to open duplicates. A driver task
//! polls the event loop, re-subscribes consumers after every reconnect, and
//! routes inbound publishes to per-consumer queues without ever awaiting
//! downstream work, so one slow consumer cannot stall delivery to the
//! others or starve the poll loop. Each consumer enforces its prefetch with
//! a semaphore held from hand-off until acknowledgment: at most `prefetch`
//! messages are unacknowledged at any moment. Messages are acknowledged
//! manually, after the handler ran; handler failures are logged and the
//! message is acked anyway so one bad payload can never wedge the queue.

use crate::config::BrokerConfig;
use crate::error::PipelineError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const TELEMETRY_QUEUE: &str = "telemetry_updates";
pub const COMMANDS_QUEUE: &str = "device_commands";
pub const ANALYTICS_QUEUE: &str = "analytics_jobs";

/// Fixed backoff applied to every transport-level retry.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

enum RouteCmd {
    Register {
        topic: String,
        tx: mpsc::UnboundedSender<Publish>,
    },
}

#[derive(Clone)]
struct Conn {
    client: AsyncClient,
    router_tx: mpsc::UnboundedSender<RouteCmd>,
}

pub struct BrokerGateway {
    cfg: BrokerConfig,
    conn: Mutex<Option<Conn>>,
}

/// Handle to a live consumer loop; aborting it is the cancellation point.
pub struct Subscription {
    queue: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        debug!(queue = %self.queue, "cancelling subscription");
        self.handle.abort();
    }
}

impl BrokerGateway {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self {
            cfg,
            conn: Mutex::new(None),
        }
    }

    /// Idempotent: returns the cached live connection or establishes a new
    /// one. The guard is held only while establishing, never while using it.
    async fn connect(&self) -> Result<Conn, PipelineError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        info!(host = %self.cfg.host, port = self.cfg.port, "connecting to broker");
        let mut opts = MqttOptions::new(&self.cfg.client_id, &self.cfg.host, self.cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));
        // Persistent session + QoS1 is what "durable queue" means here.
        opts.set_clean_session(false);
        opts.set_manual_acks(true);
        if let Some((user, pass)) = &self.cfg.credentials {
            opts.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(opts, 64);
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(eventloop, router_rx, client.clone()));

        let conn = Conn { client, router_tx };
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection so the next use re-establishes it.
    async fn reset(&self) {
        self.conn.lock().await.take();
    }

    /// Publish a JSON payload at-least-once. A dead cached handle is replaced
    /// transparently; the caller only sees an error when re-establishing
    /// fails too.
    pub async fn publish<T: Serialize>(&self, queue: &str, payload: &T) -> Result<(), PipelineError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| PipelineError::malformed(queue, e))?;

        let conn = self.connect().await?;
        match conn
            .client
            .publish(queue, QoS::AtLeastOnce, false, body.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(queue, error = %first, "publish hit a dead connection, reconnecting");
                self.reset().await;
                let conn = self.connect().await?;
                conn.client
                    .publish(queue, QoS::AtLeastOnce, false, body)
                    .await
                    .map_err(PipelineError::transport)
            }
        }
    }

    /// Subscribe to a durable queue and feed each payload to `handler`.
    ///
    /// At most `prefetch` messages are unacknowledged at once for this
    /// consumer; each is acknowledged after the handler returns, success or
    /// not.
    pub async fn consume<F, Fut>(&self, queue: &str, handler: F) -> Result<Subscription, PipelineError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        let conn = self.connect().await?;
        let (tx, rx) = mpsc::unbounded_channel::<Publish>();
        conn.router_tx
            .send(RouteCmd::Register {
                topic: queue.to_string(),
                tx,
            })
            .map_err(|_| PipelineError::Transport("broker driver is gone".into()))?;
        conn.client
            .subscribe(queue, QoS::AtLeastOnce)
            .await
            .map_err(PipelineError::transport)?;
        info!(queue, "consumer subscribed");

        let client = conn.client.clone();
        let queue_name = queue.to_string();
        let acker = move |publish: Publish| {
            let client = client.clone();
            async move {
                if let Err(e) = client.ack(&publish).await {
                    warn!(error = %e, "ack failed");
                }
            }
        };
        let handle = tokio::spawn(consumer_loop(
            rx,
            self.cfg.prefetch,
            queue_name,
            Arc::new(handler),
            acker,
        ));

        Ok(Subscription {
            queue: queue.to_string(),
            handle,
        })
    }

    /// Release the connection during shutdown.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            if let Err(e) = conn.client.disconnect().await {
                debug!(error = %e, "broker disconnect");
            }
        }
    }
}

/// Per-consumer delivery loop. A semaphore permit is held from hand-off to
/// acknowledgment, so at most `prefetch` messages are unacknowledged at any
/// moment; with the default prefetch of 1 handlers also run strictly in
/// arrival order. The ack runs in the handler task, never in the driver.
async fn consumer_loop<F, Fut, A, AFut>(
    mut rx: mpsc::UnboundedReceiver<Publish>,
    prefetch: usize,
    queue: String,
    handler: Arc<F>,
    acker: A,
) where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
    A: Fn(Publish) -> AFut + Clone + Send + Sync + 'static,
    AFut: Future<Output = ()> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(prefetch));
    while let Some(publish) = rx.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let handler = handler.clone();
        let acker = acker.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            if let Err(e) = handler(publish.payload.to_vec()).await {
                // Logged and acked regardless: forward progress beats
                // strict delivery for this pipeline.
                error!(queue = %queue, error = %e, "message handler failed");
            }
            acker(publish).await;
            drop(permit);
        });
    }
}

/// Event-loop driver: routes publishes, re-subscribes on every (re)connect,
/// applies the fixed backoff on transport errors. Never awaits downstream
/// work inside the poll loop, so consumers cannot stall it or each other.
/// Runs until the gateway drops its router handle.
async fn drive(
    mut eventloop: EventLoop,
    mut router_rx: mpsc::UnboundedReceiver<RouteCmd>,
    client: AsyncClient,
) {
    let mut routes: HashMap<String, mpsc::UnboundedSender<Publish>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = router_rx.recv() => match cmd {
                Some(RouteCmd::Register { topic, tx }) => {
                    routes.insert(topic, tx);
                }
                None => {
                    debug!("gateway dropped, stopping broker driver");
                    break;
                }
            },
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match routes.get(&publish.topic) {
                        Some(tx) => {
                            if tx.send(publish.clone()).is_err() {
                                debug!(topic = %publish.topic, "consumer gone, dropping message");
                            }
                        }
                        None => debug!(topic = %publish.topic, "no consumer registered"),
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("broker session established");
                    for topic in routes.keys() {
                        if let Err(e) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                            warn!(topic = %topic, error = %e, "re-subscribe failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "broker transport error, retrying in {}s", RECONNECT_DELAY.as_secs());
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}
