//! In-process message bus.
//!
//! Every topic is a single partition whose log is retained forever, so
//! `StartFrom::Earliest` replays everything ever published. Delivery to each
//! subscriber is ordered. Publishing to a topic can be made to fail for tests.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{BusRecord, MessageBus, StartFrom, Subscription};
use crate::error::BridgeError;

const PARTITION: i32 = 0;

#[derive(Default)]
struct TopicLog {
    records: Vec<BusRecord>,
    subscribers: Vec<mpsc::UnboundedSender<BusRecord>>,
}

/// Message bus backed by in-memory logs.
#[derive(Default)]
pub struct InMemoryBus {
    topics: DashMap<String, TopicLog>,
    failing: DashSet<String>,
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("topics", &self.topics.len())
            .finish()
    }
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish to `topic` fail until [`InMemoryBus::heal`].
    pub fn fail_publishes_to(&self, topic: &str) {
        self.failing.insert(topic.to_string());
    }

    pub fn heal(&self, topic: &str) {
        self.failing.remove(topic);
    }

    /// Copy of everything published to `topic`.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<BusRecord> {
        self.topics
            .get(topic)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Number of open subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|log| log.subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, key: Value, value: Option<Value>) -> Result<(), BridgeError> {
        if self.failing.contains(topic) {
            return Err(BridgeError::Bus {
                topic: topic.to_string(),
                reason: "publish rejected".to_string(),
            });
        }

        let mut log = self.topics.entry(topic.to_string()).or_default();
        let record = BusRecord {
            topic: topic.to_string(),
            key,
            value,
            partition: PARTITION,
            offset: log.records.len() as i64,
        };
        log.subscribers
            .retain(|subscriber| subscriber.send(record.clone()).is_ok());
        log.records.push(record);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, start: StartFrom) -> Result<Subscription, BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut log = self.topics.entry(topic.to_string()).or_default();

        if start == StartFrom::Earliest {
            for record in &log.records {
                // Receiver is alive: it is still in this scope.
                let _ = tx.send(record.clone());
            }
        }
        let end = log.records.len() as i64;
        log.subscribers.push(tx);
        debug!(topic, end_offset = end, ?start, "Subscribed to in-memory topic");

        Ok(Subscription::new(topic, HashMap::from([(PARTITION, end)]), rx))
    }
}
