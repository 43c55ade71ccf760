use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge};
use serde_json::json;
use tokio::{
    sync::Mutex,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::tap::{StageEvent, StageKind, TapHub};

/// In-flight OAuth login attempt, keyed by its `state` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuth {
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
}

impl PendingAuth {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        now.signed_duration_since(self.created_at) > ttl
    }
}

/// Table of pending OAuth logins shared between handlers and the sweeper.
#[derive(Clone)]
pub struct PendingAuthStore {
    entries: Arc<Mutex<HashMap<String, PendingAuth>>>,
    ttl: Duration,
}

impl PendingAuthStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn insert(&self, state: String, pending: PendingAuth) {
        let mut entries = self.entries.lock().await;
        entries.insert(state, pending);
        gauge!("oauth_pending_states").set(entries.len() as f64);
    }

    /// Removes and returns the record for `state`. A state value is usable once.
    pub async fn take(&self, state: &str) -> Option<PendingAuth> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(state);
        gauge!("oauth_pending_states").set(entries.len() as f64);
        removed
    }

    /// Drops every record older than the TTL and returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, pending| !pending.is_expired(now, self.ttl));
        gauge!("oauth_pending_states").set(entries.len() as f64);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Background task that evicts abandoned login attempts.
#[derive(Clone)]
pub struct AuthSweeper {
    store: PendingAuthStore,
    tap: TapHub,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
}

impl AuthSweeper {
    pub fn new(store: PendingAuthStore, tap: TapHub, interval: Duration) -> Self {
        Self {
            store,
            tap,
            clock: Arc::new(Utc::now),
            interval,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the sweep loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// Executes one sweep and returns the number of evicted records.
    pub async fn run_once(&self) -> usize {
        let now = (self.clock)();
        let removed = self.store.purge_expired(now).await;
        if removed == 0 {
            debug!(stage = "oauth", "pending auth sweep found nothing to remove");
            return 0;
        }

        counter!("oauth_pending_swept_total").increment(removed as u64);
        let remaining = self.store.len().await;
        info!(
            stage = "oauth",
            removed,
            remaining,
            ttl_secs = self.store.ttl().as_secs(),
            "expired pending auth records removed"
        );
        self.tap.publish(StageEvent::labelled(
            now,
            StageKind::Oauth,
            "oauth.pending.swept",
            json!({ "removed": removed }),
        ));
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry;
    use tokio::time::timeout;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn take_consumes_the_record() {
        let store = PendingAuthStore::new(Duration::from_secs(60));
        store
            .insert(
                "state-1".into(),
                PendingAuth {
                    code_verifier: "verifier".into(),
                    created_at: at("2025-01-01T00:00:00Z"),
                },
            )
            .await;

        let taken = store.take("state-1").await.expect("present");
        assert_eq!(taken.code_verifier, "verifier");
        assert!(store.take("state-1").await.is_none());
        assert_eq!(store.len().await, 0);
    }

    #[test]
    fn expiry_is_strictly_older_than_ttl() {
        let pending = PendingAuth {
            code_verifier: "v".into(),
            created_at: at("2025-01-01T00:00:00Z"),
        };
        let ttl = Duration::from_secs(3600);
        assert!(!pending.is_expired(at("2025-01-01T01:00:00Z"), ttl));
        assert!(pending.is_expired(at("2025-01-01T01:00:01Z"), ttl));
    }

    #[tokio::test]
    async fn run_once_removes_expired_and_emits_event() {
        telemetry::init_metrics().expect("metrics");
        let now = at("2025-01-01T02:00:00Z");
        let store = PendingAuthStore::new(Duration::from_secs(3600));
        store
            .insert(
                "old".into(),
                PendingAuth {
                    code_verifier: "a".into(),
                    created_at: at("2025-01-01T00:00:00Z"),
                },
            )
            .await;
        store
            .insert(
                "fresh".into(),
                PendingAuth {
                    code_verifier: "b".into(),
                    created_at: at("2025-01-01T01:30:00Z"),
                },
            )
            .await;

        let tap = TapHub::new();
        let mut tap_rx = tap.subscribe();
        let sweeper = AuthSweeper::new(store.clone(), tap, Duration::from_secs(300))
            .with_clock(Arc::new(move || now));

        assert_eq!(sweeper.run_once().await, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.take("fresh").await.is_some());

        let event = timeout(Duration::from_secs(1), tap_rx.recv())
            .await
            .expect("tap event")
            .expect("sweep event");
        assert_eq!(event.stage, StageKind::Oauth);
        assert_eq!(event.meta.message.as_deref(), Some("oauth.pending.swept"));

        assert_eq!(sweeper.run_once().await, 0);
    }
}
