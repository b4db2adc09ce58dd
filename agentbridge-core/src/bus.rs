//! Publish/subscribe transport contract.
//!
//! The bridge only needs two operations from its transport: publishing a
//! keyed record (a `None` value is a tombstone) and tailing a topic. A
//! subscription reports the topic's end offsets at subscribe time so that
//! consumers of compacted topics can tell when they have caught up.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::BridgeError;

/// A record read from a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: String,
    pub key: Value,
    /// `None` marks a tombstone.
    pub value: Option<Value>,
    pub partition: i32,
    pub offset: i64,
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Replay the topic from its first retained record
    Earliest,
    /// Only records published after subscribing
    Latest,
}

/// A live subscription to one topic.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    end_offsets: HashMap<i32, i64>,
    records: mpsc::UnboundedReceiver<BusRecord>,
}

impl Subscription {
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        end_offsets: HashMap<i32, i64>,
        records: mpsc::UnboundedReceiver<BusRecord>,
    ) -> Self {
        Self {
            topic: topic.into(),
            end_offsets,
            records,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next offset to be written per partition, as of subscribe time.
    #[must_use]
    pub fn end_offsets(&self) -> &HashMap<i32, i64> {
        &self.end_offsets
    }

    /// Waits for the next record. `None` once the transport closed the stream.
    pub async fn recv(&mut self) -> Option<BusRecord> {
        self.records.recv().await
    }
}

/// Transport the bridge publishes to and consumes from.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `value` under `key`. `None` publishes a tombstone.
    async fn publish(&self, topic: &str, key: Value, value: Option<Value>) -> Result<(), BridgeError>;

    /// Starts tailing `topic`.
    async fn subscribe(&self, topic: &str, start: StartFrom) -> Result<Subscription, BridgeError>;
}
