use std::{collections::HashSet, time::Duration};

use axum::response::sse::{Event, KeepAlive};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Ingress,
    Classifier,
    Transport,
    Proxy,
    Oauth,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Ingress => "ingress",
            StageKind::Classifier => "classifier",
            StageKind::Transport => "transport",
            StageKind::Proxy => "proxy",
            StageKind::Oauth => "oauth",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "ingress" => Some(StageKind::Ingress),
            "classifier" => Some(StageKind::Classifier),
            "transport" => Some(StageKind::Transport),
            "proxy" => Some(StageKind::Proxy),
            "oauth" => Some(StageKind::Oauth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageMetadata {
    fn is_empty(&self) -> bool {
        self.event_kind.is_none()
            && self.seq.is_none()
            && self.size_bytes.is_none()
            && self.latency_ms.is_none()
            && self.message.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StagePayload {
    pub redacted: bool,
    pub payload: Value,
}

impl Default for StagePayload {
    fn default() -> Self {
        Self {
            redacted: false,
            payload: Value::Null,
        }
    }
}

impl StagePayload {
    /// Payload that has already been reduced to identifiers.
    pub fn redacted(payload: Value) -> Self {
        Self {
            redacted: true,
            payload,
        }
    }
}

/// One observation of the request pipeline, streamed to `/_debug/tap`.
///
/// Payloads are never raw message bodies or tokens; callers pass redacted
/// summaries only.
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub ts: DateTime<Utc>,
    pub stage: StageKind,
    #[serde(default, skip_serializing_if = "StageMetadata::is_empty")]
    pub meta: StageMetadata,
    pub r#in: StagePayload,
    pub out: StagePayload,
}

impl StageEvent {
    /// Builds an event with a message label and a redacted output payload.
    pub fn labelled(ts: DateTime<Utc>, stage: StageKind, message: &str, out: Value) -> Self {
        Self {
            ts,
            stage,
            meta: StageMetadata {
                message: Some(message.to_string()),
                ..StageMetadata::default()
            },
            r#in: StagePayload::default(),
            out: StagePayload::redacted(out),
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.stage.as_str()
    }

    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let mut event = Event::default().event(self.event_name());
        if let Some(seq) = self.meta.seq {
            event = event.id(seq.to_string());
        }
        let data = serde_json::to_string(&self)?;
        Ok(event.data(data))
    }

    pub fn heartbeat(message: &str) -> Self {
        Self::labelled(
            Utc::now(),
            StageKind::Transport,
            message,
            json!({ "message": message }),
        )
    }
}

#[derive(Clone)]
pub struct TapHub {
    sender: broadcast::Sender<StageEvent>,
}

impl TapHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    /// Publishes to current tap listeners; events are dropped when nobody listens.
    pub fn publish(&self, event: StageEvent) {
        if self.sender.send(event).is_err() {
            debug!(stage = "transport", "no tap listeners");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }

    pub fn spawn_heartbeat(&self) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                hub.publish(StageEvent::heartbeat("tap.dev.heartbeat"));
            }
        });
    }
}

impl Default for TapHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TapFilter {
    stages: Option<HashSet<StageKind>>,
}

impl TapFilter {
    pub fn from_stages(stages: Option<HashSet<StageKind>>) -> Self {
        Self { stages }
    }

    pub fn matches(&self, event: &StageEvent) -> bool {
        match &self.stages {
            Some(stages) => stages.contains(&event.stage),
            None => true,
        }
    }
}

pub fn tap_stream(
    hub: TapHub,
    filter: TapFilter,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(move |result| match result {
        Ok(event) if filter.matches(&event) => Some(event.into_sse_event()),
        _ => None,
    })
}

pub fn tap_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

pub fn parse_stage_list(value: Option<String>) -> Result<Option<HashSet<StageKind>>, String> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let mut set = HashSet::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let normalized = item.to_lowercase();
        let stage = StageKind::parse(&normalized)
            .ok_or_else(|| format!("unknown stage '{normalized}'"))?;
        set.insert(stage);
    }

    if set.is_empty() {
        Ok(None)
    } else {
        Ok(Some(set))
    }
}
