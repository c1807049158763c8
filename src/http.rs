//! Observer-facing HTTP surface: a health snapshot and the live
//! `telemetry_update` stream over SSE. The REST CRUD surface for devices and
//! sales lives elsewhere; this process only exposes what it owns.

use crate::stores::DeviceRegistry;
use crate::telemetry::PushHub;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn DeviceRegistry>,
    pub push: PushHub,
    pub started: Instant,
}

#[derive(Serialize)]
struct PipelineHealth {
    uptime_seconds: u64,
    devices_tracked: usize,
    observers_connected: usize,
}

async fn health(State(state): State<AppState>) -> Json<PipelineHealth> {
    let devices = state.registry.list_serials().await.map(|s| s.len()).unwrap_or(0);
    Json(PipelineHealth {
        uptime_seconds: state.started.elapsed().as_secs(),
        devices_tracked: devices,
        observers_connected: state.push.observer_count(),
    })
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.push.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        let push = item.ok()?;
        let event = Event::default()
            .event("telemetry_update")
            .json_data(&push)
            .ok()?;
        Some(Ok(event))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(events))
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("observer surface on http://{addr}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
