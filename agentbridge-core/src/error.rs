//! Error types for the bridge.
//!
//! `BridgeError` covers every failure the core can report. Most of them never
//! reach a caller as an `Err`: correlation failures are folded into `ERROR`
//! responses (see [`crate::protocol::Response::error`]) and decode failures
//! into protocol error results. The stable [`BridgeError::error_type_name`]
//! doubles as the `className` of serialized exceptions and as a metrics label.

use thiserror::Error;

use crate::registration::CapabilityKind;

/// Result alias used across the crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Failures surfaced by the bridge core.
#[derive(Debug, Error)]
pub enum BridgeError {
    // ─────────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────────
    /// The message bus refused a publish or subscribe.
    #[error("message bus error on topic '{topic}': {reason}")]
    Bus {
        /// Topic the operation targeted
        topic: String,
        /// Transport-provided description
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Topology
    // ─────────────────────────────────────────────────────────────────────────
    /// The cluster reported zero live brokers.
    #[error("no live brokers available to create topic '{topic}'")]
    NoLiveBrokers {
        /// Topic that could not be created
        topic: String,
    },

    /// Topic creation failed for a reason other than "already exists".
    #[error("failed to create topic '{topic}': {reason}")]
    TopicCreation { topic: String, reason: String },

    /// Registering a schema against a subject failed.
    #[error("failed to register schema for subject '{subject}': {reason}")]
    SchemaRegistration { subject: String, reason: String },

    /// Fetching or parsing the latest schema for a subject failed.
    #[error("failed to resolve schema for subject '{subject}': {reason}")]
    SchemaLookup { subject: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Correlation
    // ─────────────────────────────────────────────────────────────────────────
    /// No reply arrived before the request's deadline.
    #[error(
        "timed out after {timeout_ms}ms waiting for a reply from '{registration}' (correlation id {correlation_id})"
    )]
    Timeout {
        registration: String,
        correlation_id: String,
        timeout_ms: u64,
    },

    /// The pending entry was pushed out of the correlation cache before a
    /// reply arrived.
    #[error("pending request to '{registration}' was evicted (correlation id {correlation_id})")]
    Evicted {
        registration: String,
        correlation_id: String,
    },

    /// The bridge shut down while the request was still pending.
    #[error("request to '{registration}' cancelled: {reason}")]
    Shutdown { registration: String, reason: String },

    /// The request could not be published to its request topic.
    #[error("failed to publish request to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// A reply matched a pending request but could not be decoded.
    #[error("undecodable reply on topic '{topic}': {reason}")]
    MalformedReply { topic: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Protocol surface
    // ─────────────────────────────────────────────────────────────────────────
    /// An inbound protocol call could not be turned into a request payload.
    #[error("invalid {kind} call for '{name}': {reason}")]
    Decode {
        kind: CapabilityKind,
        name: String,
        reason: String,
    },

    /// A protocol server refused to register or unregister a capability.
    #[error("protocol server rejected capability '{name}': {reason}")]
    ServerRegistration { name: String, reason: String },

    /// The registration asks for something this front end cannot expose.
    #[error("capability '{name}' is not supported: {reason}")]
    Unsupported { name: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Data model
    // ─────────────────────────────────────────────────────────────────────────
    /// A registration record failed validation.
    #[error("invalid registration: {reason}")]
    InvalidRegistration { reason: String },

    /// An append was attempted on a completed work unit.
    #[error("work unit {correlation_id} is already complete")]
    WorkItemsComplete { correlation_id: String },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Stable, machine-readable name for the error variant.
    #[must_use]
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::Bus { .. } => "bus_error",
            Self::NoLiveBrokers { .. } => "no_live_brokers",
            Self::TopicCreation { .. } => "topic_creation_failed",
            Self::SchemaRegistration { .. } => "schema_registration_failed",
            Self::SchemaLookup { .. } => "schema_lookup_failed",
            Self::Timeout { .. } => "timeout",
            Self::Evicted { .. } => "evicted",
            Self::Shutdown { .. } => "cancelled",
            Self::Publish { .. } => "publish_failed",
            Self::MalformedReply { .. } => "malformed_reply",
            Self::Decode { .. } => "decode_error",
            Self::ServerRegistration { .. } => "server_registration_failed",
            Self::Unsupported { .. } => "unsupported",
            Self::InvalidRegistration { .. } => "invalid_registration",
            Self::WorkItemsComplete { .. } => "work_items_complete",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Returns true for failures that block a registration from activating
    /// and are only retried on the next log event.
    #[must_use]
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            Self::NoLiveBrokers { .. }
                | Self::TopicCreation { .. }
                | Self::SchemaRegistration { .. }
                | Self::SchemaLookup { .. }
        )
    }

    /// Returns true for failures that resolve a pending request.
    #[must_use]
    pub fn is_correlation(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Evicted { .. }
                | Self::Shutdown { .. }
                | Self::Publish { .. }
                | Self::MalformedReply { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_names_are_unique() {
        let errors = [
            BridgeError::Bus {
                topic: "t".into(),
                reason: "r".into(),
            },
            BridgeError::NoLiveBrokers { topic: "t".into() },
            BridgeError::TopicCreation {
                topic: "t".into(),
                reason: "r".into(),
            },
            BridgeError::SchemaRegistration {
                subject: "s".into(),
                reason: "r".into(),
            },
            BridgeError::SchemaLookup {
                subject: "s".into(),
                reason: "r".into(),
            },
            BridgeError::Timeout {
                registration: "sum".into(),
                correlation_id: "abc".into(),
                timeout_ms: 200,
            },
            BridgeError::Evicted {
                registration: "sum".into(),
                correlation_id: "abc".into(),
            },
            BridgeError::Shutdown {
                registration: "sum".into(),
                reason: "bye".into(),
            },
            BridgeError::Publish {
                topic: "t".into(),
                reason: "r".into(),
            },
            BridgeError::MalformedReply {
                topic: "t".into(),
                reason: "r".into(),
            },
        ];

        let mut names: Vec<_> = errors.iter().map(BridgeError::error_type_name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), errors.len());
    }

    #[test]
    fn test_classification() {
        assert!(BridgeError::NoLiveBrokers { topic: "t".into() }.is_topology());
        assert!(
            BridgeError::Timeout {
                registration: "sum".into(),
                correlation_id: "x".into(),
                timeout_ms: 1,
            }
            .is_correlation()
        );
        assert!(
            !BridgeError::InvalidRegistration {
                reason: "empty".into()
            }
            .is_topology()
        );
    }

    #[test]
    fn test_timeout_message_mentions_duration() {
        let err = BridgeError::Timeout {
            registration: "sum".into(),
            correlation_id: "abc".into(),
            timeout_ms: 200,
        };
        let msg = err.to_string();
        assert!(msg.contains("200ms"));
        assert!(msg.contains("sum"));
    }
}
