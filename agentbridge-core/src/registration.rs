//! Registration records published on the registration log.
//!
//! A registration announces one capability: its name, the pair of topics the
//! bridge talks to it over, the key field that carries correlation ids, and
//! the front-end protocol it should be exposed on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Key field used when a registration does not name one.
pub const DEFAULT_CORRELATION_FIELD: &str = "correlationId";

/// Front-end protocol a capability is exposed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// Tool on the tool/resource RPC protocol
    #[default]
    Tool,
    /// Readable resource on the tool/resource RPC protocol
    Resource,
    /// Agent on the agent-to-agent protocol
    A2a,
    /// Plain REST endpoint
    Rest,
}

impl CapabilityKind {
    /// All kinds, in a fixed order.
    pub const ALL: [CapabilityKind; 4] = [Self::Tool, Self::Resource, Self::A2a, Self::Rest];

    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::A2a => "a2a",
            Self::Rest => "rest",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tool" => Ok(Self::Tool),
            "resource" => Ok(Self::Resource),
            "a2a" | "agent" => Ok(Self::A2a),
            "rest" => Ok(Self::Rest),
            other => Err(BridgeError::InvalidRegistration {
                reason: format!("unknown registration type '{other}'"),
            }),
        }
    }
}

/// Key of a record on the registration log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationKey {
    pub name: String,
}

impl RegistrationKey {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&Registration> for RegistrationKey {
    fn from(registration: &Registration) -> Self {
        Self::new(registration.name.clone())
    }
}

fn default_correlation_field() -> String {
    DEFAULT_CORRELATION_FIELD.to_string()
}

/// One announced capability.
///
/// # Example
/// ```json
/// {
///   "registrationType": "tool",
///   "name": "sum",
///   "description": "Adds two numbers",
///   "requestTopicName": "sum-req",
///   "responseTopicName": "sum-res",
///   "correlationIdFieldName": "correlationId"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Front end the capability is exposed on (default: tool).
    #[serde(default)]
    pub registration_type: CapabilityKind,

    /// Unique capability name.
    pub name: String,

    /// Human description shown by the front end.
    #[serde(default)]
    pub description: String,

    /// Topic the bridge publishes requests to.
    pub request_topic_name: String,

    /// Topic the backend publishes replies to.
    pub response_topic_name: String,

    /// Key field carrying the correlation id (default: `correlationId`).
    #[serde(default = "default_correlation_field")]
    pub correlation_id_field_name: String,

    /// MIME type of a resource capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// URL of a resource capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Registration {
    /// Creates a tool registration with the default correlation field.
    #[must_use]
    pub fn tool(
        name: impl Into<String>,
        description: impl Into<String>,
        request_topic: impl Into<String>,
        response_topic: impl Into<String>,
    ) -> Self {
        Self {
            registration_type: CapabilityKind::Tool,
            name: name.into(),
            description: description.into(),
            request_topic_name: request_topic.into(),
            response_topic_name: response_topic.into(),
            correlation_id_field_name: default_correlation_field(),
            mime_type: None,
            url: None,
        }
    }

    /// Creates a resource registration. A leading `/` on the url is dropped.
    #[must_use]
    pub fn resource(
        name: impl Into<String>,
        description: impl Into<String>,
        request_topic: impl Into<String>,
        response_topic: impl Into<String>,
        mime_type: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let mut registration = Self::tool(name, description, request_topic, response_topic)
            .with_kind(CapabilityKind::Resource);
        registration.mime_type = Some(mime_type.into());
        registration.url = Some(normalize_url(&url.into()));
        registration
    }

    /// Sets the capability kind.
    #[must_use]
    pub fn with_kind(mut self, kind: CapabilityKind) -> Self {
        self.registration_type = kind;
        self
    }

    /// Sets the key field carrying correlation ids.
    #[must_use]
    pub fn with_correlation_field(mut self, field: impl Into<String>) -> Self {
        self.correlation_id_field_name = field.into();
        self
    }

    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        self.registration_type
    }

    #[must_use]
    pub fn key(&self) -> RegistrationKey {
        RegistrationKey::from(self)
    }

    /// Resource url without a leading slash.
    #[must_use]
    pub fn resource_url(&self) -> Option<String> {
        self.url.as_deref().map(normalize_url)
    }

    /// Resource urls containing `{` are URI templates.
    #[must_use]
    pub fn is_template(&self) -> bool {
        self.url.as_deref().is_some_and(|url| url.contains('{'))
    }

    /// Checks the record before it is published or materialized.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let invalid = |reason: String| BridgeError::InvalidRegistration { reason };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.request_topic_name.trim().is_empty() || self.response_topic_name.trim().is_empty() {
            return Err(invalid(format!(
                "registration '{}' must name both a request and a response topic",
                self.name
            )));
        }
        if self.request_topic_name == self.response_topic_name {
            return Err(invalid(format!(
                "registration '{}' uses '{}' as both request and response topic",
                self.name, self.request_topic_name
            )));
        }
        if self.correlation_id_field_name.trim().is_empty() {
            return Err(invalid(format!(
                "registration '{}' has an empty correlation field name",
                self.name
            )));
        }
        if self.registration_type == CapabilityKind::Resource
            && self.url.as_deref().is_none_or(|url| url.trim().is_empty())
        {
            return Err(invalid(format!(
                "resource registration '{}' requires a url",
                self.name
            )));
        }
        Ok(())
    }
}

fn normalize_url(url: &str) -> String {
    url.strip_prefix('/').unwrap_or(url).to_string()
}
