//! Front-end protocol server contract.
//!
//! A protocol server is whatever actually speaks the front-end protocol to
//! callers. The bridge only registers capabilities with it, hands it a
//! callback per capability, and removes capabilities again.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::protocol::{Payload, SerializableException};
use crate::registration::CapabilityKind;

/// Resource address advertised for resource capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub mime_type: String,
}

/// What a protocol server needs to list a capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub kind: CapabilityKind,
    pub input_schema: Value,
    pub output_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceDescriptor>,
}

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

/// One entry of a resource read result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResourceContents {
    #[serde(rename_all = "camelCase")]
    Text {
        uri: String,
        mime_type: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Blob {
        uri: String,
        mime_type: String,
        blob: String,
    },
}

/// Task state reported to agent-to-agent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    Completed,
    InputRequired,
    Failed,
}

/// Result handed back to a protocol server for one inbound call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CallResult {
    #[serde(rename_all = "camelCase")]
    Tool {
        content: Vec<ToolContent>,
        is_error: bool,
    },
    Resource { contents: Vec<ResourceContents> },
    Agent {
        state: AgentState,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Rest { status: u16, body: Value },
    /// Protocol-level failure for front ends without an error shape of
    /// their own.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exception: Option<SerializableException>,
    },
}

impl CallResult {
    /// True for results that report a failure to the caller.
    #[must_use]
    pub fn is_error(&self) -> bool {
        match self {
            Self::Tool { is_error, .. } => *is_error,
            Self::Resource { .. } => false,
            Self::Agent { state, .. } => *state == AgentState::Failed,
            Self::Rest { status, .. } => *status >= 400,
            Self::Error { .. } => true,
        }
    }
}

/// Future resolving to the result of one call.
pub type CallFuture = BoxFuture<'static, CallResult>;

/// Callback a protocol server invokes for each inbound call. Receives the
/// raw call arguments.
pub type OnCall = Arc<dyn Fn(Value) -> CallFuture + Send + Sync>;

/// A front-end protocol server.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Lists `descriptor` and routes its calls to `on_call`.
    async fn register_capability(
        &self,
        descriptor: CapabilityDescriptor,
        on_call: OnCall,
    ) -> Result<(), BridgeError>;

    /// Stops listing the capability.
    async fn unregister_capability(&self, kind: CapabilityKind, name: &str) -> Result<(), BridgeError>;

    /// False for servers that cannot remove a capability once listed.
    fn supports_unregister(&self) -> bool {
        true
    }
}

/// The protocol server of each capability kind.
#[derive(Clone)]
pub struct ProtocolServers {
    pub tool: Arc<dyn ProtocolServer>,
    pub resource: Arc<dyn ProtocolServer>,
    pub a2a: Arc<dyn ProtocolServer>,
    pub rest: Arc<dyn ProtocolServer>,
}

impl std::fmt::Debug for ProtocolServers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolServers").finish_non_exhaustive()
    }
}

impl ProtocolServers {
    /// One server for every kind.
    #[must_use]
    pub fn shared(server: Arc<dyn ProtocolServer>) -> Self {
        Self {
            tool: server.clone(),
            resource: server.clone(),
            a2a: server.clone(),
            rest: server,
        }
    }

    #[must_use]
    pub fn for_kind(&self, kind: CapabilityKind) -> &Arc<dyn ProtocolServer> {
        match kind {
            CapabilityKind::Tool => &self.tool,
            CapabilityKind::Resource => &self.resource,
            CapabilityKind::A2a => &self.a2a,
            CapabilityKind::Rest => &self.rest,
        }
    }
}
