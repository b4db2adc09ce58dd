//! In-process schema registry.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::BridgeError;
use crate::schema::SchemaStore;

/// Schema store keeping every registered version in memory.
#[derive(Debug, Default)]
pub struct InMemorySchemaStore {
    subjects: DashMap<String, Vec<String>>,
    lookups: DashMap<String, u32>,
    next_id: AtomicU32,
    reject_registrations: AtomicBool,
}

impl InMemorySchemaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent registration fail.
    pub fn fail_registrations(&self) {
        self.reject_registrations.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn contains(&self, subject: &str) -> bool {
        self.subjects.contains_key(subject)
    }

    /// How many times `subject` was looked up.
    #[must_use]
    pub fn lookups(&self, subject: &str) -> u32 {
        self.lookups.get(subject).map(|count| *count).unwrap_or(0)
    }
}

#[async_trait]
impl SchemaStore for InMemorySchemaStore {
    async fn latest_schema(&self, subject: &str) -> Result<String, BridgeError> {
        *self.lookups.entry(subject.to_string()).or_insert(0) += 1;
        self.subjects
            .get(subject)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| BridgeError::SchemaLookup {
                subject: subject.to_string(),
                reason: "subject not found".to_string(),
            })
    }

    async fn register_schema(&self, subject: &str, schema: &str) -> Result<u32, BridgeError> {
        if self.reject_registrations.load(Ordering::SeqCst) {
            return Err(BridgeError::SchemaRegistration {
                subject: subject.to_string(),
                reason: "registrations disabled".to_string(),
            });
        }
        let mut versions = self.subjects.entry(subject.to_string()).or_default();
        if versions.last().map(String::as_str) != Some(schema) {
            versions.push(schema.to_string());
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
