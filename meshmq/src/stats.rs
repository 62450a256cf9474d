//! Broker gauges.
//!
//! `connections` and `sessions` are maintained by the connection lifecycle; the other
//! figures belong to the registry, the ack manager and the store and are copied in by
//! [`Stats::snapshot`].

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::context::ServerContext;
use crate::utils::Counter;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stats {
    pub handshakings: Counter,
    pub connections: Counter,
    pub sessions: Counter,
    pub subscriptions: Counter,
    pub retaineds: Counter,
    pub message_queues: Counter,
    pub out_inflights: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy including the component-owned gauges.
    pub async fn snapshot(&self, scx: &ServerContext) -> Self {
        self.retaineds.sets(scx.store.retained_count().await);
        self.message_queues.sets(scx.store.session_messages().await);
        Self {
            handshakings: self.handshakings.clone(),
            connections: self.connections.clone(),
            sessions: self.sessions.clone(),
            subscriptions: scx.registry.subscriptions().clone(),
            retaineds: self.retaineds.clone(),
            message_queues: self.message_queues.clone(),
            out_inflights: scx.acks.inflights().clone(),
        }
    }

    /// Folds in the figures of another node.
    #[inline]
    pub fn add(&mut self, other: Self) {
        self.handshakings.add(&other.handshakings);
        self.connections.add(&other.connections);
        self.sessions.add(&other.sessions);
        self.subscriptions.add(&other.subscriptions);
        self.retaineds.add(&other.retaineds);
        self.message_queues.add(&other.message_queues);
        self.out_inflights.add(&other.out_inflights);
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "handshakings.count": self.handshakings.count(),
            "handshakings.max": self.handshakings.max(),
            "connections.count": self.connections.count(),
            "connections.max": self.connections.max(),
            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "subscriptions.count": self.subscriptions.count(),
            "subscriptions.max": self.subscriptions.max(),
            "retaineds.count": self.retaineds.count(),
            "retaineds.max": self.retaineds.max(),
            "message_queues.count": self.message_queues.count(),
            "message_queues.max": self.message_queues.max(),
            "out_inflights.count": self.out_inflights.count(),
            "out_inflights.max": self.out_inflights.max(),
        })
    }
}
