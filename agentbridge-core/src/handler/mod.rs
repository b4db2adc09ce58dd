//! Protocol handlers: one registration exposed on one front end.
//!
//! Every capability kind shares the same core (registration, schemas,
//! request/response handler, protocol server); only the call decoding, the
//! result encoding and the server registration differ, see [`codec`].
//!
//! ## Lifecycle
//!
//! ```text
//! new ──► initialize() ──► (serving calls) ──► teardown()
//!            │
//!            └── Err: not listed, nothing to tear down
//! ```

pub mod codec;
mod server;

pub use server::{
    AgentState, CallFuture, CallResult, CapabilityDescriptor, OnCall, ProtocolServer,
    ProtocolServers, ResourceContents, ResourceDescriptor, ToolContent,
};

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::correlation::RequestResponseHandler;
use crate::error::BridgeError;
use crate::registration::{CapabilityKind, Registration};
use crate::schema::RegistrationSchemas;
use crate::topics::TopicManager;

/// Adapts one registration to its kind's protocol server.
pub struct ProtocolHandler {
    registration: Registration,
    topics: Arc<TopicManager>,
    correlation: Arc<RequestResponseHandler>,
    server: Arc<dyn ProtocolServer>,
    schemas: OnceCell<RegistrationSchemas>,
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("name", &self.registration.name)
            .field("kind", &self.registration.kind())
            .field("schemas_resolved", &self.schemas.initialized())
            .finish()
    }
}

impl ProtocolHandler {
    #[must_use]
    pub fn new(
        registration: Registration,
        topics: Arc<TopicManager>,
        correlation: Arc<RequestResponseHandler>,
        servers: &ProtocolServers,
    ) -> Arc<Self> {
        let server = servers.for_kind(registration.kind()).clone();
        Arc::new(Self {
            registration,
            topics,
            correlation,
            server,
            schemas: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.registration.name
    }

    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        self.registration.kind()
    }

    /// Schemas, once [`ProtocolHandler::initialize`] resolved them.
    #[must_use]
    pub fn schemas(&self) -> Option<&RegistrationSchemas> {
        self.schemas.get()
    }

    /// Resolves schemas and lists the capability with its protocol server.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), BridgeError> {
        let registration = &self.registration;
        if registration.kind() == CapabilityKind::Resource && registration.is_template() {
            return Err(BridgeError::Unsupported {
                name: registration.name.clone(),
                reason: "resource template registration is not supported".to_string(),
            });
        }

        let schemas = self.resolve_schemas().await?;
        let descriptor = self.descriptor(schemas);

        let handler = Arc::clone(self);
        let on_call: OnCall = Arc::new(move |raw: Value| -> CallFuture {
            let handler = handler.clone();
            Box::pin(async move { handler.on_request(raw).await })
        });

        self.server
            .register_capability(descriptor, on_call)
            .await
            .map_err(|e| match e {
                err @ BridgeError::ServerRegistration { .. } => err,
                other => BridgeError::ServerRegistration {
                    name: registration.name.clone(),
                    reason: other.to_string(),
                },
            })?;

        info!(
            registration = %registration.name,
            kind = %registration.kind(),
            "Capability registered with protocol server"
        );
        Ok(())
    }

    async fn resolve_schemas(&self) -> Result<&RegistrationSchemas, BridgeError> {
        self.schemas
            .get_or_try_init(|| async {
                let request = self
                    .topics
                    .value_schema(&self.registration.request_topic_name)
                    .await?;
                let response = self
                    .topics
                    .value_schema(&self.registration.response_topic_name)
                    .await?;
                Ok(RegistrationSchemas { request, response })
            })
            .await
    }

    /// Descriptor listed with the protocol server.
    #[must_use]
    pub fn descriptor(&self, schemas: &RegistrationSchemas) -> CapabilityDescriptor {
        let registration = &self.registration;
        let resource = (registration.kind() == CapabilityKind::Resource).then(|| {
            ResourceDescriptor {
                uri: registration.resource_url().unwrap_or_default(),
                mime_type: registration
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "text/plain".to_string()),
            }
        });

        CapabilityDescriptor {
            name: registration.name.clone(),
            description: registration.description.clone(),
            kind: registration.kind(),
            input_schema: schemas.input_schema(),
            output_schema: schemas.output_schema(),
            resource,
        }
    }

    /// Removes the capability from its protocol server.
    ///
    /// Agent-to-agent servers have no deregistration; teardown completes
    /// immediately for them.
    pub async fn teardown(&self) -> Result<(), BridgeError> {
        let kind = self.registration.kind();
        if kind == CapabilityKind::A2a || !self.server.supports_unregister() {
            debug!(registration = %self.registration.name, %kind, "No deregistration for kind");
            return Ok(());
        }
        self.server
            .unregister_capability(kind, &self.registration.name)
            .await?;
        info!(registration = %self.registration.name, %kind, "Capability removed from protocol server");
        Ok(())
    }

    /// Serves one inbound call.
    pub async fn on_request(&self, raw: Value) -> CallResult {
        let kind = self.registration.kind();
        let payload = match codec::decode_call(&self.registration, raw) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(registration = %self.registration.name, error = %err, "Rejected inbound call");
                return codec::decode_error_result(kind, &err);
            }
        };

        let response = self
            .correlation
            .send_request_response(&self.registration, payload)
            .await
            .await;

        debug!(
            registration = %self.registration.name,
            status = %response.status(),
            "Reply received"
        );
        codec::encode_response(&self.registration, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationConfig;
    use crate::memory::{InMemoryBus, InMemoryProtocolServer, InMemorySchemaStore, InMemoryTopicAdmin};
    use crate::protocol::{request_envelope_schema, response_envelope_schema};
    use crate::schema::{SchemaSide, SchemaStore};
    use crate::topics::TopicSettings;
    use serde_json::json;

    struct Fixture {
        schemas: Arc<InMemorySchemaStore>,
        server: Arc<InMemoryProtocolServer>,
        topics: Arc<TopicManager>,
        correlation: Arc<RequestResponseHandler>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryBus::new());
        let schemas = Arc::new(InMemorySchemaStore::new());
        let topics = Arc::new(TopicManager::new(
            Arc::new(InMemoryTopicAdmin::new(1)),
            schemas.clone(),
            TopicSettings::default(),
        ));
        Fixture {
            schemas,
            server: Arc::new(InMemoryProtocolServer::new()),
            topics,
            correlation: RequestResponseHandler::new(bus, CorrelationConfig::default()),
        }
    }

    async fn publish_schemas(store: &InMemorySchemaStore, registration: &Registration) {
        let input = json!({"type": "object", "properties": {"a": {"type": "integer"}}});
        let output = json!({"type": "object", "properties": {"result": {"type": "integer"}}});
        store
            .register_schema(
                &SchemaSide::Value.subject(&registration.request_topic_name),
                &request_envelope_schema(input).to_string(),
            )
            .await
            .unwrap();
        store
            .register_schema(
                &SchemaSide::Value.subject(&registration.response_topic_name),
                &response_envelope_schema(output).to_string(),
            )
            .await
            .unwrap();
    }

    fn handler(fx: &Fixture, registration: Registration) -> Arc<ProtocolHandler> {
        ProtocolHandler::new(
            registration,
            fx.topics.clone(),
            fx.correlation.clone(),
            &ProtocolServers::shared(fx.server.clone()),
        )
    }

    #[tokio::test]
    async fn test_initialize_lists_capability_with_payload_schemas() {
        let fx = fixture();
        let registration = Registration::tool("sum", "adds", "sum-req", "sum-res");
        publish_schemas(&fx.schemas, &registration).await;

        let handler = handler(&fx, registration);
        handler.initialize().await.unwrap();

        let descriptor = fx.server.descriptor(CapabilityKind::Tool, "sum").unwrap();
        assert_eq!(descriptor.description, "adds");
        assert_eq!(descriptor.input_schema["properties"]["a"]["type"], "integer");
        assert_eq!(descriptor.output_schema["properties"]["result"]["type"], "integer");
        assert!(handler.schemas().is_some());
    }

    #[tokio::test]
    async fn test_initialize_fails_without_schemas() {
        let fx = fixture();
        let handler = handler(&fx, Registration::tool("sum", "adds", "sum-req", "sum-res"));

        let err = handler.initialize().await.unwrap_err();
        assert!(err.is_topology());
        assert_eq!(fx.server.registration_count(), 0);
    }

    #[tokio::test]
    async fn test_template_resource_is_unsupported() {
        let fx = fixture();
        let registration =
            Registration::resource("doc", "", "doc-req", "doc-res", "text/plain", "docs/{id}");
        let err = handler(&fx, registration).initialize().await.unwrap_err();
        assert_eq!(err.error_type_name(), "unsupported");
    }

    #[tokio::test]
    async fn test_a2a_teardown_is_noop() {
        let fx = fixture();
        let registration =
            Registration::tool("planner", "", "plan-req", "plan-res").with_kind(CapabilityKind::A2a);
        publish_schemas(&fx.schemas, &registration).await;

        let handler = handler(&fx, registration);
        handler.initialize().await.unwrap();
        handler.teardown().await.unwrap();

        assert!(fx.server.descriptor(CapabilityKind::A2a, "planner").is_some());
        assert_eq!(fx.server.unregistration_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_unlists_tool() {
        let fx = fixture();
        let registration = Registration::tool("sum", "adds", "sum-req", "sum-res");
        publish_schemas(&fx.schemas, &registration).await;

        let handler = handler(&fx, registration);
        handler.initialize().await.unwrap();
        handler.teardown().await.unwrap();

        assert!(fx.server.descriptor(CapabilityKind::Tool, "sum").is_none());
    }

    #[tokio::test]
    async fn test_undecodable_call_never_reaches_backend() {
        let fx = fixture();
        let handler = handler(&fx, Registration::tool("sum", "adds", "sum-req", "sum-res"));

        let result = handler.on_request(json!("not an object")).await;
        assert!(result.is_error());
        assert_eq!(fx.correlation.pending_count(), 0);
    }
}
