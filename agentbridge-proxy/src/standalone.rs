//! Single-process wiring over the in-memory bus, schema store, topic admin
//! and protocol server.

use std::sync::Arc;
use tracing::info;

use agentbridge_core::BridgeError;
use agentbridge_core::agent::AgentRuntime;
use agentbridge_core::config::Config;
use agentbridge_core::coordinator::{BridgeComponents, RegistrationCoordinator};
use agentbridge_core::correlation::RequestResponseHandler;
use agentbridge_core::handler::ProtocolServers;
use agentbridge_core::memory::{
    InMemoryBus, InMemoryProtocolServer, InMemorySchemaStore, InMemoryTopicAdmin,
};
use agentbridge_core::metrics::BridgeMetrics;
use agentbridge_core::store::RegistrationStore;
use agentbridge_core::topics::TopicManager;

/// A running bridge and the in-memory backends it talks to.
#[derive(Debug, Clone)]
pub struct StandaloneBridge {
    pub bus: Arc<InMemoryBus>,
    pub topics: Arc<TopicManager>,
    pub server: Arc<InMemoryProtocolServer>,
    pub store: Arc<RegistrationStore>,
    pub correlation: Arc<RequestResponseHandler>,
    pub coordinator: Arc<RegistrationCoordinator>,
}

impl StandaloneBridge {
    /// Builds every component from `config` and starts replaying the
    /// registration log.
    pub async fn start(
        config: &Config,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Result<Self, BridgeError> {
        let bus = Arc::new(InMemoryBus::new());
        let topics = Arc::new(TopicManager::new(
            Arc::new(InMemoryTopicAdmin::new(usize::from(
                config.topics.replication_factor,
            ))),
            Arc::new(InMemorySchemaStore::new()),
            config.topic_settings(),
        ));
        let server = Arc::new(InMemoryProtocolServer::new());

        let correlation = match &metrics {
            Some(metrics) => RequestResponseHandler::with_metrics(
                bus.clone(),
                config.correlation_config(),
                metrics.clone(),
            ),
            None => RequestResponseHandler::new(bus.clone(), config.correlation_config()),
        };
        let store = RegistrationStore::start(bus.clone(), config.store_config()).await?;
        let coordinator = RegistrationCoordinator::start(BridgeComponents {
            store: store.clone(),
            topics: topics.clone(),
            correlation: correlation.clone(),
            servers: ProtocolServers::shared(server.clone()),
            metrics,
        })?;

        info!(
            registry_topic = %store.topic(),
            response_timeout_ms = config.correlation.response_timeout.as_millis(),
            "Standalone bridge started"
        );

        Ok(Self {
            bus,
            topics,
            server,
            store,
            correlation,
            coordinator,
        })
    }

    /// Backend runtime sharing this bridge's bus and topic manager.
    #[must_use]
    pub fn agent_runtime(&self) -> AgentRuntime {
        AgentRuntime::new(self.bus.clone(), self.topics.clone(), self.store.topic())
    }

    /// Tears down handlers, fails pending requests, then stops the store.
    pub async fn shutdown(&self) {
        let torn_down = self.coordinator.shutdown().await;
        let failed = self.correlation.shutdown().await;
        self.store.shutdown().await;
        info!(
            handlers_torn_down = torn_down,
            pending_failed = failed,
            "Bridge components stopped"
        );
    }
}
