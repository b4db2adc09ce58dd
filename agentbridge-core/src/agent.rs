//! Backend side of the bridge.
//!
//! [`AgentRuntime`] is what a capability provider runs: it provisions the
//! capability's topics and schemas, announces the registration on the
//! registration log and answers every request published to its request
//! topic by publishing a [`Response`] under the same record key.

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::{BusRecord, MessageBus, StartFrom, Subscription};
use crate::error::BridgeError;
use crate::protocol::{
    Payload, Request, Response, correlation_key_schema, request_envelope_schema,
    response_envelope_schema,
};
use crate::registration::{Registration, RegistrationKey};
use crate::topics::TopicManager;

/// Failure reported by an agent's request handler.
///
/// Published as an `ERROR` response whose exception carries `class_name`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct AgentFailure {
    pub class_name: String,
    pub message: String,
}

impl AgentFailure {
    #[must_use]
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
        }
    }
}

type HandlerFn =
    Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<Response, AgentFailure>> + Send + Sync>;

/// Hosts capabilities on the backend side of the bus.
pub struct AgentRuntime {
    bus: Arc<dyn MessageBus>,
    topics: Arc<TopicManager>,
    registry_topic: String,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("registry_topic", &self.registry_topic)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl AgentRuntime {
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topics: Arc<TopicManager>,
        registry_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            topics,
            registry_topic: registry_topic.into(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Provisions `registration`, starts answering its requests and
    /// announces it.
    ///
    /// `request_schema` and `response_schema` describe the payloads; they are
    /// wrapped in the envelope schemas before registration.
    pub async fn register<F, Fut>(
        &self,
        registration: Registration,
        request_schema: Value,
        response_schema: Value,
        handler: F,
    ) -> Result<(), BridgeError>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, AgentFailure>> + Send + 'static,
    {
        registration.validate()?;
        let key_schema = correlation_key_schema(&registration.correlation_id_field_name).to_string();

        self.topics
            .create_topic(
                &registration.request_topic_name,
                &key_schema,
                &request_envelope_schema(request_schema).to_string(),
            )
            .await?;
        self.topics
            .create_topic(
                &registration.response_topic_name,
                &key_schema,
                &response_envelope_schema(response_schema).to_string(),
            )
            .await?;

        // Subscribe before announcing so no request can be missed.
        let subscription = self
            .bus
            .subscribe(&registration.request_topic_name, StartFrom::Latest)
            .await?;
        let serve: HandlerFn = Arc::new(move |payload: Payload| -> BoxFuture<'static, _> {
            Box::pin(handler(payload))
        });
        self.tasks.spawn(serve_requests(
            self.bus.clone(),
            registration.response_topic_name.clone(),
            subscription,
            serve,
            self.tasks.clone(),
            self.shutdown.clone(),
        ));

        let key = serde_json::to_value(registration.key())?;
        let value = serde_json::to_value(&registration)?;
        self.bus
            .publish(&self.registry_topic, key, Some(value))
            .await?;
        info!(
            registration = %registration.name,
            kind = %registration.kind(),
            "Agent registered"
        );
        Ok(())
    }

    /// Withdraws the registration. Requests already received are still
    /// answered.
    pub async fn unregister(&self, name: &str) -> Result<(), BridgeError> {
        let key = serde_json::to_value(RegistrationKey::new(name))?;
        self.bus.publish(&self.registry_topic, key, None).await?;
        info!(registration = name, "Agent unregistered");
        Ok(())
    }

    /// Stops serving and waits for in-flight handlers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn serve_requests(
    bus: Arc<dyn MessageBus>,
    response_topic: String,
    mut subscription: Subscription,
    handler: HandlerFn,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            record = subscription.recv() => record,
        };
        let Some(record) = record else {
            break;
        };

        let bus = bus.clone();
        let handler = handler.clone();
        let response_topic = response_topic.clone();
        tasks.spawn(async move {
            let BusRecord { key, value, .. } = record;
            let response = answer(value, &handler).await;
            if let Err(e) = bus.publish(&response_topic, key, Some(response)).await {
                warn!(topic = %response_topic, error = %e, "Failed to publish reply");
            }
        });
    }
    debug!(topic = %subscription.topic(), "Agent request consumer stopped");
}

async fn answer(value: Option<Value>, handler: &HandlerFn) -> Value {
    let response = match value.map(serde_json::from_value::<Request>) {
        Some(Ok(request)) => {
            let index = u32::try_from(request.request_index).unwrap_or(0);
            match handler(request.payload).await {
                Ok(response) => response.answering(index),
                Err(failure) => Response::error_for(index, failure.message, &failure.class_name),
            }
        }
        Some(Err(e)) => Response::error_for(0, format!("undecodable request: {e}"), "decode_error"),
        None => Response::error_for(0, "request has no value", "decode_error"),
    };
    serde_json::to_value(&response).unwrap_or_else(|_| Value::Object(Payload::new()))
}
