use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xaa_core::{render, ActivityEvent, EventCard, EventFeed};

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind, StageMetadata, StagePayload};

/// Recommended client polling cadence, advertised in the poll acknowledgement.
pub const POLL_INTERVAL_SECS: u64 = 5;
const BROADCAST_CAPACITY: usize = 256;
/// Most pollers remembered at once; the least recently seen is forgotten beyond it.
pub const MAX_POLLERS: usize = 1024;
/// A poller silent for longer than this is forgotten and acknowledged again on return.
const POLLER_IDLE_SECS: i64 = 300;
/// How long a push connection may stay open without sending its auth message.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_MESSAGE: &str = "Connected to the live activity feed.";

/// One activity delivery as handed to the dashboard.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeliveredEvent {
    pub seq: u64,
    pub received_at: DateTime<Utc>,
    pub kind: String,
    pub payload: Value,
    pub event: ActivityEvent,
    pub card: EventCard,
}

/// Messages written to the dashboard by either transport.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    ConnectionAck {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        poll_interval_secs: Option<u64>,
        card: EventCard,
    },
    Event(DeliveredEvent),
    Events {
        events: Vec<DeliveredEvent>,
    },
}

impl OutboundMessage {
    fn ack(now: DateTime<Utc>, poll_interval_secs: Option<u64>) -> Self {
        let event = ActivityEvent::ConnectionAck {
            message: ACK_MESSAGE.to_string(),
        };
        Self::ConnectionAck {
            message: ACK_MESSAGE.to_string(),
            poll_interval_secs,
            card: render(&event, now),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    Auth { token: String },
}

#[derive(Debug, Clone)]
struct LiveConnection {
    connected_at: DateTime<Utc>,
}

/// Fan-out point shared by the short-poll and push transports.
///
/// Every published event goes to the broadcast channel (push connections) and
/// into a bounded poll buffer that the first subsequent poll drains.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<DeliveredEvent>,
    poll_buffer: Arc<Mutex<EventFeed<DeliveredEvent>>>,
    pollers: Arc<Mutex<PollerRegistry>>,
    connections: Arc<RwLock<HashMap<Uuid, LiveConnection>>>,
    next_seq: Arc<AtomicU64>,
}

/// Result of a single poll.
#[derive(Debug)]
pub enum PollOutcome {
    Registered,
    Drained(Vec<DeliveredEvent>),
}

impl EventHub {
    pub fn new(max_retained: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender,
            poll_buffer: Arc::new(Mutex::new(EventFeed::new(max_retained))),
            pollers: Arc::new(Mutex::new(PollerRegistry::default())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Renders, sequences, and fans out a classified delivery.
    pub async fn publish(
        &self,
        received_at: DateTime<Utc>,
        payload: Value,
        event: ActivityEvent,
    ) -> DeliveredEvent {
        let delivered = DeliveredEvent {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            received_at,
            kind: event.kind().to_string(),
            card: render(&event, received_at),
            payload,
            event,
        };

        if let Some(evicted) = self.poll_buffer.lock().await.push(delivered.clone()) {
            debug!(
                stage = "transport",
                seq = evicted.seq,
                "poll buffer full, oldest event evicted"
            );
        }
        let receivers = self.sender.send(delivered.clone()).unwrap_or(0);
        counter!("events_published_total").increment(1);
        debug!(
            stage = "transport",
            seq = delivered.seq,
            kind = %delivered.kind,
            receivers,
            "event published"
        );
        delivered
    }

    /// Registers an unseen poller, or drains the shared buffer for a known one.
    pub async fn poll(&self, token: &str, now: DateTime<Utc>) -> PollOutcome {
        let fingerprint = token_fingerprint(token);
        let newly_registered = {
            let mut pollers = self.pollers.lock().await;
            let registered = pollers.touch(fingerprint, now);
            gauge!("transport_pollers").set(pollers.len() as f64);
            registered
        };
        if newly_registered {
            return PollOutcome::Registered;
        }
        PollOutcome::Drained(self.poll_buffer.lock().await.drain_oldest_first())
    }

    pub async fn poller_count(&self) -> usize {
        self.pollers.lock().await.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveredEvent> {
        self.sender.subscribe()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn register_connection(&self, id: Uuid, now: DateTime<Utc>) -> usize {
        let mut connections = self.connections.write().await;
        connections.insert(id, LiveConnection { connected_at: now });
        gauge!("transport_ws_connections").set(connections.len() as f64);
        connections.len()
    }

    async fn remove_connection(&self, id: &Uuid) -> Option<LiveConnection> {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(id);
        gauge!("transport_ws_connections").set(connections.len() as f64);
        removed
    }
}

/// Last poll time per token fingerprint, bounded by idle expiry and [`MAX_POLLERS`].
#[derive(Debug, Default)]
struct PollerRegistry {
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl PollerRegistry {
    /// Records a poll and returns `true` when the poller is new or had gone idle.
    fn touch(&mut self, fingerprint: String, now: DateTime<Utc>) -> bool {
        let idle = ChronoDuration::seconds(POLLER_IDLE_SECS);
        if let Some(seen) = self.last_seen.get_mut(&fingerprint) {
            let was_idle = now.signed_duration_since(*seen) > idle;
            *seen = now;
            return was_idle;
        }

        self.last_seen
            .retain(|_, seen| now.signed_duration_since(*seen) <= idle);
        if self.last_seen.len() >= MAX_POLLERS {
            let oldest = self
                .last_seen
                .iter()
                .min_by_key(|(_, seen)| **seen)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                self.last_seen.remove(&oldest);
            }
        }
        self.last_seen.insert(fingerprint, now);
        true
    }

    fn len(&self) -> usize {
        self.last_seen.len()
    }
}

/// SHA-256 hex digest of a token so registries never hold the credential itself.
fn token_fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn poll(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Result<Json<OutboundMessage>, ProblemResponse> {
    let Some(token) = query.token.as_deref().filter(|token| !token.is_empty()) else {
        counter!("transport_poll_requests_total", "result" => "unauthorized").increment(1);
        return Err(ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "missing_token",
            "token query parameter is required",
        ));
    };

    let now = state.now();
    match state.events().poll(token, now).await {
        PollOutcome::Registered => {
            counter!("transport_poll_requests_total", "result" => "ack").increment(1);
            let pollers = state.events().poller_count().await;
            info!(stage = "transport", pollers, "poller registered");
            publish_transport_event(&state, now, "transport.poll.registered", json!({}));
            Ok(Json(OutboundMessage::ack(now, Some(POLL_INTERVAL_SECS))))
        }
        PollOutcome::Drained(events) => {
            counter!("transport_poll_requests_total", "result" => "events").increment(1);
            if !events.is_empty() {
                publish_transport_event(
                    &state,
                    now,
                    "transport.poll.drained",
                    json!({ "count": events.len() }),
                );
            }
            Ok(Json(OutboundMessage::Events { events }))
        }
    }
}

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let first = match timeout(AUTH_TIMEOUT, ws_rx.next()).await {
        Ok(first) => first,
        Err(_) => {
            warn!(stage = "transport", "push connection did not authenticate in time");
            None
        }
    };
    let authenticated = match first {
        Some(Ok(Message::Text(text))) => matches!(
            serde_json::from_str::<InboundMessage>(&text),
            Ok(InboundMessage::Auth { token }) if !token.trim().is_empty()
        ),
        _ => false,
    };
    if !authenticated {
        warn!(stage = "transport", "push connection closed before authentication");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }

    let hub = state.events().clone();
    // Subscribe before acknowledging so nothing published after the ack is missed.
    let mut receiver = hub.subscribe();
    let now = state.now();
    let ack = match serde_json::to_string(&OutboundMessage::ack(now, None)) {
        Ok(text) => text,
        Err(err) => {
            warn!(stage = "transport", error = %err, "failed to encode connection ack");
            return;
        }
    };
    if ws_tx.send(Message::Text(ack)).await.is_err() {
        return;
    }

    let connection_id = Uuid::new_v4();
    let open = hub.register_connection(connection_id, now).await;
    info!(stage = "transport", %connection_id, open, "push connection authenticated");
    publish_transport_event(
        &state,
        now,
        "transport.ws.connected",
        json!({ "connection_id": connection_id, "open": open }),
    );

    let forward = tokio::spawn(async move {
        loop {
            let delivered = match receiver.recv().await {
                Ok(delivered) => delivered,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(stage = "transport", %connection_id, skipped, "push connection lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&OutboundMessage::Event(delivered)) {
                Ok(text) => text,
                Err(err) => {
                    warn!(stage = "transport", error = %err, "failed to encode event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    forward.abort();
    if let Some(connection) = hub.remove_connection(&connection_id).await {
        let duration_secs = state
            .now()
            .signed_duration_since(connection.connected_at)
            .num_seconds();
        let open = hub.connection_count().await;
        info!(
            stage = "transport",
            %connection_id,
            duration_secs,
            open,
            "push connection closed"
        );
    }
}

fn publish_transport_event(state: &AppState, ts: DateTime<Utc>, message: &str, payload: Value) {
    state.tap().publish(StageEvent {
        ts,
        stage: StageKind::Transport,
        meta: StageMetadata {
            message: Some(message.to_string()),
            ..StageMetadata::default()
        },
        r#in: StagePayload::default(),
        out: StagePayload::redacted(payload),
    });
}
