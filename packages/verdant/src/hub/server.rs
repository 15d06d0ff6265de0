//! Hub HTTP/WebSocket server
//!
//! One `/ws` endpoint serves both devices and consumers. The first
//! message on a channel decides its role: `register_esp` makes it a
//! device channel, anything else a consumer channel.
//!
//! Every channel gets a transport keepalive: the hub sends a WebSocket
//! ping each interval and force-closes the channel after two silent
//! intervals plus a margin. Devices additionally get application-level
//! pings from the registry.

use crate::config::VerdantConfig;
use crate::hub::broadcaster::StateBroadcaster;
use crate::hub::heartbeat::HeartbeatPolicy;
use crate::hub::protocol::{HubMessage, Inbound};
use crate::hub::registry::{ChannelHandle, Registry, RegistryHandle};
use crate::metrics::{HealthStatus, HubMetrics};
use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct HubState {
    pub registry: RegistryHandle,
    pub broadcaster: Arc<StateBroadcaster>,
    pub metrics: Arc<HubMetrics>,
    pub config: Arc<VerdantConfig>,
}

pub fn build_router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/metrics", get(metrics_snapshot))
        .route("/api/devices", get(device_list))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve the hub until the process is stopped.
pub async fn run(config: VerdantConfig) -> Result<()> {
    let metrics = Arc::new(HubMetrics::new());
    let broadcaster = Arc::new(StateBroadcaster::new(
        config.broadcast.clone(),
        config.sensor.clone(),
        metrics.clone(),
    ));
    let registry = Registry::spawn(
        config.presence.clone(),
        HeartbeatPolicy::new(config.heartbeat.clone()),
        broadcaster.clone(),
        metrics.clone(),
    );
    let addr = format!("{}:{}", config.host, config.port);
    let state = HubState {
        registry,
        broadcaster,
        metrics,
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "hub listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn healthz(State(state): State<HubState>) -> Json<HealthStatus> {
    let snapshot = state.metrics.snapshot();
    Json(HealthStatus {
        status: "ok".to_string(),
        devices_present: snapshot.devices.present,
        connections: snapshot.connections.active,
        uptime_secs: snapshot.uptime_secs,
    })
}

async fn metrics_snapshot(State(state): State<HubState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn device_list(State(state): State<HubState>) -> impl IntoResponse {
    match state.registry.devices().await {
        Ok(devices) => Json(devices).into_response(),
        Err(err) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            err.to_string(),
        )
            .into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(msg: &HubMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(err) => {
            warn!(%err, "failed to encode outbound message");
            None
        }
    }
}

/// Tracks when the last frame arrived, shared between the read loop
/// and the keepalive in the sender task.
struct SilenceClock {
    started: Instant,
    last_inbound_ms: AtomicU64,
}

impl SilenceClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_inbound_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_inbound_ms.store(ms, Ordering::Relaxed);
    }

    fn silent_for(&self) -> Duration {
        let last = self.last_inbound_ms.load(Ordering::Relaxed);
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }
}

async fn handle_socket(socket: WebSocket, state: HubState) {
    state.metrics.connection_opened();
    let connection_id = Uuid::new_v4();
    debug!(%connection_id, "channel opened");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<HubMessage>(100);
    let cancel = CancellationToken::new();
    let silence = Arc::new(SilenceClock::new());

    // Sender task: serializes outbound messages and runs the transport
    // keepalive. A channel silent past the deadline is force-closed.
    let sender_cancel = cancel.clone();
    let sender_silence = silence.clone();
    let transport_interval = state.config.heartbeat.transport_interval;
    let transport_deadline = state.config.heartbeat.transport_deadline();
    let sender_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(transport_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        keepalive.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                _ = sender_cancel.cancelled() => break,
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { break };
                    let Some(frame) = encode(&msg) else { continue };
                    if sink.send(frame).await.is_err() {
                        sender_cancel.cancel();
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    if sender_silence.silent_for() >= transport_deadline {
                        debug!("transport silent past deadline, closing");
                        sender_cancel.cancel();
                        break;
                    }
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        sender_cancel.cancel();
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    // Role detection: the first parsed message decides.
    let first = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        silence.touch();
                        match serde_json::from_str::<Inbound>(&text) {
                            Ok(msg) => break Some(msg),
                            Err(err) => {
                                warn!(%connection_id, %err, "malformed first message");
                                state.metrics.message_discarded();
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => silence.touch(),
                    Some(Err(_)) => break None,
                }
            }
        }
    };

    match first {
        Some(Inbound::RegisterEsp { name }) => {
            device_loop(
                &state,
                connection_id,
                name,
                &mut stream,
                out_tx,
                cancel.clone(),
                silence,
            )
            .await;
            state.registry.channel_closed(connection_id).await;
        }
        Some(first) => {
            consumer_loop(
                &state,
                connection_id,
                first,
                &mut stream,
                out_tx,
                cancel.clone(),
                silence,
            )
            .await;
        }
        None => {}
    }

    cancel.cancel();
    let _ = sender_task.await;
    state.metrics.connection_closed();
    debug!(%connection_id, "channel closed");
}

async fn device_loop(
    state: &HubState,
    connection_id: Uuid,
    name: String,
    stream: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    out_tx: mpsc::Sender<HubMessage>,
    cancel: CancellationToken,
    silence: Arc<SilenceClock>,
) {
    let handle = ChannelHandle {
        connection_id,
        sender: out_tx.clone(),
        cancel: cancel.clone(),
    };
    match state.registry.identify(handle, name.clone()).await {
        Ok(device_type) => {
            debug!(%connection_id, device = %name, %device_type, "device channel ready");
            let welcome = HubMessage::Welcome {
                client_id: connection_id.to_string(),
            };
            if out_tx.send(welcome).await.is_err() {
                return;
            }
        }
        Err(err) => {
            warn!(%connection_id, device = %name, %err, "registration rejected");
            let _ = out_tx
                .send(HubMessage::Error {
                    message: err.to_string(),
                })
                .await;
            return;
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        silence.touch();
                        continue;
                    }
                    Some(Err(_)) => break,
                };
                silence.touch();
                state.registry.activity(connection_id).await;
                match serde_json::from_str::<Inbound>(&text) {
                    Ok(Inbound::SensorData { sensor, name, value }) => {
                        state.metrics.reading_received();
                        state.broadcaster.apply_reading(sensor, value).await;
                        state.broadcaster.publish(HubMessage::SensorData {
                            sensor,
                            name,
                            value,
                        });
                    }
                    Ok(Inbound::Pong { .. }) => {
                        state.registry.pong(connection_id).await;
                    }
                    Ok(Inbound::Ping { timestamp }) => {
                        let _ = out_tx.send(HubMessage::Pong { timestamp }).await;
                    }
                    Ok(Inbound::RegisterEsp { .. }) => {
                        // Already registered on this channel.
                        state.metrics.message_discarded();
                    }
                    Ok(other) => {
                        debug!(%connection_id, ?other, "unexpected device message");
                        state.metrics.message_discarded();
                    }
                    Err(err) => {
                        warn!(%connection_id, %err, "malformed device message");
                        state.metrics.message_discarded();
                    }
                }
            }
        }
    }
}

async fn consumer_loop(
    state: &HubState,
    connection_id: Uuid,
    first: Inbound,
    stream: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    out_tx: mpsc::Sender<HubMessage>,
    cancel: CancellationToken,
    silence: Arc<SilenceClock>,
) {
    // Subscribe before answering the greeting so no event published
    // after the snapshot is missed.
    let mut events = state.broadcaster.subscribe();
    if consumer_message(state, connection_id, first, &out_tx).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                match event {
                    Ok(msg) => {
                        if out_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%connection_id, skipped, "consumer lagging, resyncing");
                        let states = state.broadcaster.snapshot().await;
                        if out_tx.send(HubMessage::StateUpdate { states }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        silence.touch();
                        continue;
                    }
                    Some(Err(_)) => break,
                };
                silence.touch();
                match serde_json::from_str::<Inbound>(&text) {
                    Ok(msg) => {
                        if consumer_message(state, connection_id, msg, &out_tx).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%connection_id, %err, "malformed consumer message");
                        state.metrics.message_discarded();
                    }
                }
            }
        }
    }
}

/// Handle one inbound consumer message. Err means the out queue is gone.
async fn consumer_message(
    state: &HubState,
    connection_id: Uuid,
    msg: Inbound,
    out_tx: &mpsc::Sender<HubMessage>,
) -> Result<(), ()> {
    let send = |m: HubMessage| async move { out_tx.send(m).await.map_err(|_| ()) };
    match msg {
        Inbound::Hello { client } => {
            info!(%connection_id, client = client.as_deref().unwrap_or("-"), "consumer hello");
            send(HubMessage::Welcome {
                client_id: connection_id.to_string(),
            })
            .await?;
            let states = state.broadcaster.snapshot().await;
            send(HubMessage::StateUpdate { states }).await?;
        }
        Inbound::GetEspStatus => {
            let states = state.broadcaster.snapshot().await;
            send(HubMessage::StateUpdate { states }).await?;
        }
        Inbound::Ping { timestamp } => {
            send(HubMessage::Pong { timestamp }).await?;
        }
        other => {
            debug!(%connection_id, ?other, "unexpected consumer message");
            state.metrics.message_discarded();
        }
    }
    Ok(())
}
