//! Topic and schema provisioning.
//!
//! [`TopicManager::create_topic`] discovers the live broker count, clamps the
//! replication factor to it, creates the topic (treating "already exists" as
//! success) and then registers the key and value schemas. Schema lookups for
//! existing topics are memoized per `(topic, side)` for the manager's
//! lifetime.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::schema::{SchemaCell, SchemaHandle, SchemaSide, SchemaStore};

/// Topic to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u16,
    pub configs: BTreeMap<String, String>,
}

/// Failure reported by a topic admin for a create request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreateTopicError {
    /// The topic is already there; callers treat this as success.
    #[error("topic '{0}' already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Failed(String),
}

/// Cluster administration contract.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Number of live brokers.
    async fn describe_cluster(&self) -> Result<usize, BridgeError>;

    /// Creates all `topics`.
    async fn create_topics(&self, topics: Vec<NewTopic>) -> Result<(), CreateTopicError>;
}

/// Settings applied to every created topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSettings {
    pub partitions: u32,
    pub replication_factor: u16,
    /// Bound on each admin call
    pub admin_timeout: Duration,
    /// Extra topic configs; `cleanup.policy=compact` is always set
    pub configs: BTreeMap<String, String>,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            partitions: 6,
            replication_factor: 3,
            admin_timeout: Duration::from_secs(10),
            configs: BTreeMap::new(),
        }
    }
}

/// Creates topics and resolves their schemas.
pub struct TopicManager {
    admin: Arc<dyn TopicAdmin>,
    schemas: Arc<dyn SchemaStore>,
    settings: TopicSettings,
    resolved: DashMap<(String, SchemaSide), Arc<SchemaCell>>,
}

impl std::fmt::Debug for TopicManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicManager")
            .field("settings", &self.settings)
            .field("resolved", &self.resolved.len())
            .finish()
    }
}

impl TopicManager {
    #[must_use]
    pub fn new(
        admin: Arc<dyn TopicAdmin>,
        schemas: Arc<dyn SchemaStore>,
        settings: TopicSettings,
    ) -> Self {
        Self {
            admin,
            schemas,
            settings,
            resolved: DashMap::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &TopicSettings {
        &self.settings
    }

    /// Ensures `name` exists and registers its key/value schemas.
    pub async fn create_topic(
        &self,
        name: &str,
        key_schema: &str,
        value_schema: &str,
    ) -> Result<(), BridgeError> {
        let live_brokers = self
            .with_timeout(name, self.admin.describe_cluster())
            .await??;
        if live_brokers == 0 {
            return Err(BridgeError::NoLiveBrokers {
                topic: name.to_string(),
            });
        }

        let replication_factor = effective_replication(self.settings.replication_factor, live_brokers);
        if replication_factor < self.settings.replication_factor {
            warn!(
                topic = name,
                configured = self.settings.replication_factor,
                live_brokers,
                effective = replication_factor,
                "Replication factor lowered to the number of live brokers"
            );
        }

        let mut configs = self.settings.configs.clone();
        configs.insert("cleanup.policy".to_string(), "compact".to_string());
        let topic = NewTopic {
            name: name.to_string(),
            partitions: self.settings.partitions,
            replication_factor,
            configs,
        };

        match self
            .with_timeout(name, self.admin.create_topics(vec![topic]))
            .await?
        {
            Ok(()) => info!(
                topic = name,
                partitions = self.settings.partitions,
                replication_factor,
                "Topic created"
            ),
            Err(CreateTopicError::AlreadyExists(_)) => {
                debug!(topic = name, "Topic already exists");
            }
            Err(CreateTopicError::Failed(reason)) => {
                return Err(BridgeError::TopicCreation {
                    topic: name.to_string(),
                    reason,
                });
            }
        }

        self.register_schema(SchemaSide::Key.subject(name), key_schema)
            .await?;
        self.register_schema(SchemaSide::Value.subject(name), value_schema)
            .await?;
        Ok(())
    }

    /// Latest key schema of `topic`, memoized.
    pub async fn key_schema(&self, topic: &str) -> Result<Arc<SchemaHandle>, BridgeError> {
        self.schema(topic, SchemaSide::Key).await
    }

    /// Latest value schema of `topic`, memoized.
    pub async fn value_schema(&self, topic: &str) -> Result<Arc<SchemaHandle>, BridgeError> {
        self.schema(topic, SchemaSide::Value).await
    }

    async fn schema(&self, topic: &str, side: SchemaSide) -> Result<Arc<SchemaHandle>, BridgeError> {
        let cell = self
            .resolved
            .entry((topic.to_string(), side))
            .or_default()
            .clone();
        let subject = side.subject(topic);

        cell.get_or_resolve(|| async {
            let raw = self.schemas.latest_schema(&subject).await?;
            debug!(subject = %subject, "Resolved schema");
            SchemaHandle::parse(subject.clone(), raw)
        })
        .await
    }

    async fn register_schema(&self, subject: String, schema: &str) -> Result<(), BridgeError> {
        match self.schemas.register_schema(&subject, schema).await {
            Ok(id) => {
                debug!(subject = %subject, schema_id = id, "Schema registered");
                Ok(())
            }
            Err(err @ BridgeError::SchemaRegistration { .. }) => Err(err),
            Err(other) => Err(BridgeError::SchemaRegistration {
                subject,
                reason: other.to_string(),
            }),
        }
    }

    async fn with_timeout<T>(
        &self,
        topic: &str,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, BridgeError> {
        tokio::time::timeout(self.settings.admin_timeout, fut)
            .await
            .map_err(|_| BridgeError::TopicCreation {
                topic: topic.to_string(),
                reason: format!(
                    "admin call timed out after {}ms",
                    self.settings.admin_timeout.as_millis()
                ),
            })
    }
}

/// `min(configured, live)`, never below one.
#[must_use]
pub fn effective_replication(configured: u16, live_brokers: usize) -> u16 {
    let live = u16::try_from(live_brokers).unwrap_or(u16::MAX);
    configured.min(live).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemorySchemaStore, InMemoryTopicAdmin};

    fn manager(brokers: usize) -> (TopicManager, Arc<InMemoryTopicAdmin>, Arc<InMemorySchemaStore>) {
        let admin = Arc::new(InMemoryTopicAdmin::new(brokers));
        let schemas = Arc::new(InMemorySchemaStore::new());
        let manager = TopicManager::new(admin.clone(), schemas.clone(), TopicSettings::default());
        (manager, admin, schemas)
    }

    #[test]
    fn test_effective_replication() {
        assert_eq!(effective_replication(3, 5), 3);
        assert_eq!(effective_replication(3, 1), 1);
        assert_eq!(effective_replication(3, 0), 1);
    }

    #[tokio::test]
    async fn test_create_topic_registers_both_schemas() {
        let (manager, admin, schemas) = manager(3);
        manager
            .create_topic("sum-req", r#"{"type":"object"}"#, r#"{"type":"string"}"#)
            .await
            .unwrap();

        let created = admin.topic("sum-req").unwrap();
        assert_eq!(created.partitions, 6);
        assert_eq!(created.replication_factor, 3);
        assert_eq!(created.configs.get("cleanup.policy").map(String::as_str), Some("compact"));
        assert!(schemas.contains("sum-req-key"));
        assert!(schemas.contains("sum-req-value"));
    }

    #[tokio::test]
    async fn test_replication_clamped_to_live_brokers() {
        let (manager, admin, _) = manager(1);
        manager.create_topic("t", "{}", "{}").await.unwrap();
        assert_eq!(admin.topic("t").unwrap().replication_factor, 1);
    }

    #[tokio::test]
    async fn test_zero_brokers_is_error() {
        let (manager, admin, _) = manager(0);
        let err = manager.create_topic("t", "{}", "{}").await.unwrap_err();
        assert!(matches!(err, BridgeError::NoLiveBrokers { .. }));
        assert!(admin.topic("t").is_none());
    }

    #[tokio::test]
    async fn test_existing_topic_is_success() {
        let (manager, admin, _) = manager(3);
        manager.create_topic("t", "{}", "{}").await.unwrap();
        manager.create_topic("t", "{}", "{}").await.unwrap();
        assert_eq!(admin.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_creation_failure_is_distinct_from_schema_failure() {
        let (manager, admin, schemas) = manager(3);
        admin.fail_creates("broker unavailable");
        let err = manager.create_topic("t", "{}", "{}").await.unwrap_err();
        assert!(matches!(err, BridgeError::TopicCreation { .. }));

        admin.heal();
        schemas.fail_registrations();
        let err = manager.create_topic("t", "{}", "{}").await.unwrap_err();
        assert!(matches!(err, BridgeError::SchemaRegistration { ref subject, .. } if subject == "t-key"));
    }

    #[tokio::test]
    async fn test_value_schema_is_memoized() {
        let (manager, _, schemas) = manager(3);
        schemas
            .register_schema("sum-res-value", r#"{"properties":{"payload":{"type":"object"}}}"#)
            .await
            .unwrap();

        let first = manager.value_schema("sum-res").await.unwrap();
        let second = manager.value_schema("sum-res").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(schemas.lookups("sum-res-value"), 1);
    }

    #[tokio::test]
    async fn test_missing_schema_is_lookup_error() {
        let (manager, _, _) = manager(3);
        let err = manager.key_schema("nope").await.unwrap_err();
        assert!(matches!(err, BridgeError::SchemaLookup { .. }));
    }
}
