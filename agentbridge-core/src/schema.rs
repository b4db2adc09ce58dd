//! Schema store contract and lazily resolved schema handles.
//!
//! Schemas are opaque JSON documents to the bridge. The only structure it
//! looks at is the `payload` property of an envelope schema, which becomes
//! the input/output shape advertised by a protocol front end.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::BridgeError;

/// External schema registry.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Latest schema document registered under `subject`.
    async fn latest_schema(&self, subject: &str) -> Result<String, BridgeError>;

    /// Registers `schema` under `subject`, returning its id.
    async fn register_schema(&self, subject: &str, schema: &str) -> Result<u32, BridgeError>;
}

/// Which side of a topic record a schema describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaSide {
    Key,
    Value,
}

impl SchemaSide {
    /// Subject naming convention: `<topic>-key` / `<topic>-value`.
    #[must_use]
    pub fn subject(&self, topic: &str) -> String {
        match self {
            Self::Key => format!("{topic}-key"),
            Self::Value => format!("{topic}-value"),
        }
    }
}

impl fmt::Display for SchemaSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key => f.write_str("key"),
            Self::Value => f.write_str("value"),
        }
    }
}

/// A resolved schema: the raw document and its parsed form.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaHandle {
    subject: String,
    raw: String,
    parsed: Value,
}

impl SchemaHandle {
    /// Parses `raw` as JSON.
    pub fn parse(subject: impl Into<String>, raw: impl Into<String>) -> Result<Self, BridgeError> {
        let subject = subject.into();
        let raw = raw.into();
        let parsed = serde_json::from_str(&raw).map_err(|e| BridgeError::SchemaLookup {
            subject: subject.clone(),
            reason: format!("schema is not valid JSON: {e}"),
        })?;
        Ok(Self {
            subject,
            raw,
            parsed,
        })
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn parsed(&self) -> &Value {
        &self.parsed
    }

    /// Schema of the envelope's `payload` property, or the whole document
    /// when it does not describe an envelope.
    #[must_use]
    pub fn payload_schema(&self) -> Value {
        self.parsed
            .get("properties")
            .and_then(|properties| properties.get("payload"))
            .cloned()
            .unwrap_or_else(|| self.parsed.clone())
    }
}

/// Compute-once cell for a schema handle.
///
/// Concurrent callers wait on a single resolution. A failed resolution is
/// not cached; the next caller tries again.
#[derive(Debug, Default)]
pub struct SchemaCell {
    cell: OnceCell<Arc<SchemaHandle>>,
}

impl SchemaCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached handle, resolving it with `resolve` on first use.
    pub async fn get_or_resolve<F, Fut>(&self, resolve: F) -> Result<Arc<SchemaHandle>, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SchemaHandle, BridgeError>>,
    {
        self.cell
            .get_or_try_init(|| async { resolve().await.map(Arc::new) })
            .await
            .cloned()
    }

    #[must_use]
    pub fn get(&self) -> Option<Arc<SchemaHandle>> {
        self.cell.get().cloned()
    }
}

/// Request and response value schemas of one registration.
#[derive(Debug, Clone)]
pub struct RegistrationSchemas {
    pub request: Arc<SchemaHandle>,
    pub response: Arc<SchemaHandle>,
}

impl RegistrationSchemas {
    /// Input shape advertised to callers.
    #[must_use]
    pub fn input_schema(&self) -> Value {
        self.request.payload_schema()
    }

    /// Output shape advertised to callers.
    #[must_use]
    pub fn output_schema(&self) -> Value {
        self.response.payload_schema()
    }
}
