//! In-process topic administration.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::BridgeError;
use crate::topics::{CreateTopicError, NewTopic, TopicAdmin};

/// Topic admin over an imaginary cluster with a settable broker count.
#[derive(Debug, Default)]
pub struct InMemoryTopicAdmin {
    live_brokers: AtomicUsize,
    topics: DashMap<String, NewTopic>,
    create_calls: AtomicU32,
    failure: ArcSwapOption<String>,
}

impl InMemoryTopicAdmin {
    #[must_use]
    pub fn new(live_brokers: usize) -> Self {
        Self {
            live_brokers: AtomicUsize::new(live_brokers),
            ..Self::default()
        }
    }

    pub fn set_live_brokers(&self, count: usize) {
        self.live_brokers.store(count, Ordering::SeqCst);
    }

    /// Makes create requests fail with `reason` until [`InMemoryTopicAdmin::heal`].
    pub fn fail_creates(&self, reason: &str) {
        self.failure.store(Some(Arc::new(reason.to_string())));
    }

    pub fn heal(&self) {
        self.failure.store(None);
    }

    #[must_use]
    pub fn topic(&self, name: &str) -> Option<NewTopic> {
        self.topics.get(name).map(|topic| topic.clone())
    }

    #[must_use]
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopicAdmin for InMemoryTopicAdmin {
    async fn describe_cluster(&self) -> Result<usize, BridgeError> {
        Ok(self.live_brokers.load(Ordering::SeqCst))
    }

    async fn create_topics(&self, topics: Vec<NewTopic>) -> Result<(), CreateTopicError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.failure.load_full() {
            return Err(CreateTopicError::Failed(reason.to_string()));
        }

        let mut existing = None;
        for topic in topics {
            match self.topics.entry(topic.name.clone()) {
                Entry::Occupied(_) => existing = Some(topic.name),
                Entry::Vacant(slot) => {
                    slot.insert(topic);
                }
            }
        }
        match existing {
            Some(name) => Err(CreateTopicError::AlreadyExists(name)),
            None => Ok(()),
        }
    }
}
