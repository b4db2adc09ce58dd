//! Configuration file schema.
//!
//! ```yaml
//! schema: 1
//! registry:
//!   topic: _agent_registry
//! topics:
//!   partitions: 6
//!   replication_factor: 3
//!   admin_timeout: 10s
//!   configs:
//!     retention.ms: "-1"
//! correlation:
//!   response_timeout: 10s
//!   sweep_interval: 100ms
//!   max_pending: 10000
//! admin:
//!   bind: 0.0.0.0
//!   port: 8080
//! ```
//!
//! Every section is optional; omitted values come from [`BridgeDefaults`].

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use super::defaults::BridgeDefaults;
use super::duration_format;
use crate::correlation::CorrelationConfig;
use crate::store::{DEFAULT_REGISTRY_TOPIC, StoreConfig};
use crate::topics::TopicSettings;

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Schema version (must be 1)
    pub schema: u32,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub topics: TopicsConfig,

    #[serde(default)]
    pub correlation: CorrelationSection,

    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema: 1,
            registry: RegistryConfig::default(),
            topics: TopicsConfig::default(),
            correlation: CorrelationSection::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Config {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            topic: self.registry.topic.clone(),
            max_entries: self.registry.max_entries,
        }
    }

    pub fn topic_settings(&self) -> TopicSettings {
        TopicSettings {
            partitions: self.topics.partitions,
            replication_factor: self.topics.replication_factor,
            admin_timeout: self.topics.admin_timeout,
            configs: self.topics.configs.clone(),
        }
    }

    pub fn correlation_config(&self) -> CorrelationConfig {
        CorrelationConfig {
            response_timeout: self.correlation.response_timeout,
            sweep_interval: self.correlation.sweep_interval,
            max_pending: self.correlation.max_pending,
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Registration log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_topic")]
    pub topic: String,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            topic: default_registry_topic(),
            max_entries: default_max_entries(),
        }
    }
}

/// Settings for capability topics.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicsConfig {
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    #[serde(default = "default_replication_factor")]
    pub replication_factor: u16,

    #[serde(default = "default_admin_timeout", deserialize_with = "duration_format::deserialize")]
    pub admin_timeout: Duration,

    /// Extra topic configs passed through to topic creation
    #[serde(default)]
    pub configs: BTreeMap<String, String>,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
            admin_timeout: default_admin_timeout(),
            configs: BTreeMap::new(),
        }
    }
}

/// Request/response correlation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorrelationSection {
    #[serde(
        default = "default_response_timeout",
        deserialize_with = "duration_format::deserialize"
    )]
    pub response_timeout: Duration,

    #[serde(
        default = "default_sweep_interval",
        deserialize_with = "duration_format::deserialize"
    )]
    pub sweep_interval: Duration,

    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            response_timeout: default_response_timeout(),
            sweep_interval: default_sweep_interval(),
            max_pending: default_max_pending(),
        }
    }
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Drain budget on shutdown; falls back to `AGENTBRIDGE_SHUTDOWN_TIMEOUT_MS`
    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub shutdown_timeout: Option<Duration>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            shutdown_timeout: None,
        }
    }
}

impl AdminConfig {
    /// Socket address to listen on, or `None` if `bind` is not an IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = self.bind.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
            .unwrap_or_else(|| BridgeDefaults::from_env().shutdown_timeout)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serde defaults
// ─────────────────────────────────────────────────────────────────────────────

fn default_registry_topic() -> String {
    DEFAULT_REGISTRY_TOPIC.to_string()
}

fn default_max_entries() -> usize {
    StoreConfig::default().max_entries
}

fn default_partitions() -> u32 {
    TopicSettings::default().partitions
}

fn default_replication_factor() -> u16 {
    TopicSettings::default().replication_factor
}

fn default_admin_timeout() -> Duration {
    BridgeDefaults::from_env().admin_timeout
}

fn default_response_timeout() -> Duration {
    BridgeDefaults::from_env().response_timeout
}

fn default_sweep_interval() -> Duration {
    BridgeDefaults::from_env().sweep_interval
}

fn default_max_pending() -> usize {
    BridgeDefaults::from_env().max_pending
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}
