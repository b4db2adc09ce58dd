//! Registration coordinator: one protocol handler per live registration.
//!
//! The coordinator drains the registration store's event channel on a single
//! task, which is the only writer of the active-handler index. Readers take
//! lock-free snapshots of that index.
//!
//! ## Per-name state machine
//!
//! ```text
//!          value, initialize ok            tombstone
//! Unseen ─────────────────────────► Active ──────────► Torn-down
//!   ▲  │                              │  ▲
//!   │  └─ value, initialize fails     │  └─ changed value: teardown, rebuild
//!   └──── (retried on the next        └──── same value: no-op
//!          announcement)
//! ```
//!
//! Registrations that leave the active set release their response route;
//! replies to requests still in flight keep being matched until they resolve.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::correlation::RequestResponseHandler;
use crate::error::BridgeError;
use crate::handler::{ProtocolHandler, ProtocolServers};
use crate::metrics::BridgeMetrics;
use crate::registration::{Registration, RegistrationKey};
use crate::store::{RegistrationStore, StoreEvent};
use crate::topics::TopicManager;

type ActiveIndex = HashMap<String, Arc<ProtocolHandler>>;

/// Everything the coordinator wires together.
#[derive(Debug, Clone)]
pub struct BridgeComponents {
    pub store: Arc<RegistrationStore>,
    pub topics: Arc<TopicManager>,
    pub correlation: Arc<RequestResponseHandler>,
    pub servers: ProtocolServers,
    pub metrics: Option<Arc<BridgeMetrics>>,
}

/// Builds, initializes and tears down protocol handlers as registrations
/// come and go.
pub struct RegistrationCoordinator {
    components: BridgeComponents,
    active: ArcSwap<ActiveIndex>,
    loaded: watch::Sender<bool>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for RegistrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationCoordinator")
            .field("active", &self.active.load().len())
            .field("loaded", &*self.loaded.borrow())
            .finish()
    }
}

impl RegistrationCoordinator {
    /// Takes the store's event stream and starts the coordinator task.
    pub fn start(components: BridgeComponents) -> Result<Arc<Self>, BridgeError> {
        let events = components.store.subscribe().ok_or_else(|| BridgeError::Bus {
            topic: components.store.topic().to_string(),
            reason: "registration events already have a subscriber".to_string(),
        })?;
        let (loaded, _) = watch::channel(false);

        let coordinator = Arc::new(Self {
            components,
            active: ArcSwap::from_pointee(HashMap::new()),
            loaded,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        coordinator
            .tasks
            .spawn(run(coordinator.clone(), events));
        Ok(coordinator)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Snapshot of all active handlers, sorted by name.
    #[must_use]
    pub fn get_all_registration_handlers(&self) -> Vec<Arc<ProtocolHandler>> {
        let mut handlers: Vec<_> = self.active.load().values().cloned().collect();
        handlers.sort_by(|a, b| a.name().cmp(b.name()));
        handlers
    }

    #[must_use]
    pub fn handler(&self, name: &str) -> Option<Arc<ProtocolHandler>> {
        self.active.load().get(name).cloned()
    }

    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.active.load().contains_key(name)
    }

    /// True if the registration log currently holds `name`.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.components
            .store
            .is_registered(&RegistrationKey::new(name))
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RegistrationStore> {
        &self.components.store
    }

    /// True once the initial registrations have been processed.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Resolves once the initial registrations have been processed.
    pub async fn wait_until_loaded(&self) {
        let mut loaded = self.loaded.subscribe();
        let _ = loaded.wait_for(|done| *done).await;
    }

    // ========================================================================
    // Log writes
    // ========================================================================

    /// Publishes `registration` to the registration log.
    pub async fn register(&self, registration: &Registration) -> Result<(), BridgeError> {
        self.components.store.register(registration).await
    }

    /// Publishes a tombstone for `name`.
    pub async fn unregister(&self, name: &str) -> Result<(), BridgeError> {
        self.components
            .store
            .unregister(&RegistrationKey::new(name))
            .await
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    async fn handle_update(&self, update: impl IntoIterator<Item = (RegistrationKey, Option<Registration>)>) {
        for (key, value) in update {
            match value {
                Some(registration) => self.activate(registration).await,
                None => self.deactivate(&key.name).await,
            }
        }
    }

    async fn activate(&self, registration: Registration) {
        let name = registration.name.clone();
        let kind = registration.kind();

        if let Some(current) = self.handler(&name) {
            if current.registration() == &registration {
                debug!(registration = %name, "Registration already active");
                self.record_event("duplicate", kind.as_str());
                return;
            }
            info!(registration = %name, %kind, "Registration changed, replacing handler");
            self.record_event("replaced", kind.as_str());
            let count = self.remove_active(&name);
            self.teardown(&current).await;
            self.record_active(count);
            if current.registration().response_topic_name != registration.response_topic_name {
                self.components
                    .correlation
                    .release_responses(current.registration())
                    .await;
            }
        }

        let parts = &self.components;
        let handler = ProtocolHandler::new(
            registration,
            parts.topics.clone(),
            parts.correlation.clone(),
            &parts.servers,
        );

        let result = match parts
            .correlation
            .subscribe_responses(handler.registration())
            .await
        {
            Ok(()) => handler.initialize().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                registration = %name,
                %kind,
                error = %e,
                error_type = e.error_type_name(),
                "Failed to activate registration"
            );
            self.record_event("activation_failed", kind.as_str());
            parts.correlation.release_responses(handler.registration()).await;
            return;
        }

        let mut next = ActiveIndex::clone(&self.active.load());
        next.insert(name.clone(), handler);
        let count = next.len();
        self.active.store(Arc::new(next));

        info!(registration = %name, %kind, active = count, "Registration active");
        self.record_event("activated", kind.as_str());
        self.record_active(count);
    }

    async fn deactivate(&self, name: &str) {
        let Some(handler) = self.handler(name) else {
            debug!(registration = %name, "Tombstone for inactive registration ignored");
            return;
        };
        let count = self.remove_active(name);
        self.teardown(&handler).await;
        self.record_active(count);
        self.components
            .correlation
            .release_responses(handler.registration())
            .await;
    }

    /// Drops `name` from the active index. Returns the remaining count.
    fn remove_active(&self, name: &str) -> usize {
        let mut next = ActiveIndex::clone(&self.active.load());
        next.remove(name);
        let count = next.len();
        self.active.store(Arc::new(next));
        count
    }

    async fn teardown(&self, handler: &ProtocolHandler) {
        let kind = handler.kind();
        match handler.teardown().await {
            Ok(()) => info!(registration = %handler.name(), %kind, "Registration torn down"),
            Err(e) => warn!(
                registration = %handler.name(),
                %kind,
                error = %e,
                "Teardown failed, handler removed anyway"
            ),
        }
        self.record_event("torn_down", kind.as_str());
    }

    fn record_event(&self, event: &str, kind: &str) {
        if let Some(metrics) = &self.components.metrics {
            metrics.record_registration_event(event, kind);
        }
    }

    fn record_active(&self, count: usize) {
        if let Some(metrics) = &self.components.metrics {
            metrics.set_active_registrations(count);
        }
    }

    fn mark_loaded(&self) {
        if !self.loaded.send_replace(true) {
            info!(active = self.active.load().len(), "Initial registrations processed");
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops the coordinator task and tears down every active handler.
    ///
    /// Returns the number of handlers torn down.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let handlers = self.active.swap(Arc::new(HashMap::new()));
        for handler in handlers.values() {
            self.teardown(handler).await;
        }
        self.record_active(0);
        info!(torn_down = handlers.len(), "Registration coordinator stopped");
        handlers.len()
    }
}

async fn run(coordinator: Arc<RegistrationCoordinator>, mut events: mpsc::UnboundedReceiver<StoreEvent>) {
    let mut awaiting_initial_update = false;
    loop {
        let event = tokio::select! {
            biased;
            _ = coordinator.shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            debug!("Registration event stream closed");
            break;
        };

        match event {
            StoreEvent::InitialLoadComplete { count } => {
                debug!(count, "Registration store loaded");
                if count == 0 {
                    coordinator.mark_loaded();
                } else {
                    awaiting_initial_update = true;
                }
            }
            StoreEvent::Update(update) => {
                coordinator.handle_update(update).await;
                if awaiting_initial_update {
                    awaiting_initial_update = false;
                    coordinator.mark_loaded();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationConfig;
    use crate::metrics::RegistrationEventLabels;
    use crate::memory::{InMemoryBus, InMemoryProtocolServer, InMemorySchemaStore, InMemoryTopicAdmin};
    use crate::registration::CapabilityKind;
    use crate::schema::{SchemaSide, SchemaStore};
    use crate::store::StoreConfig;
    use crate::topics::TopicSettings;
    use prometheus_client::registry::Registry;
    use std::time::Duration;

    struct Fixture {
        schemas: Arc<InMemorySchemaStore>,
        server: Arc<InMemoryProtocolServer>,
        coordinator: Arc<RegistrationCoordinator>,
        metrics: Arc<BridgeMetrics>,
    }

    async fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryBus::new());
        let schemas = Arc::new(InMemorySchemaStore::new());
        let server = Arc::new(InMemoryProtocolServer::new());
        let mut registry = Registry::default();
        let metrics = Arc::new(BridgeMetrics::new(&mut registry));

        let store = RegistrationStore::start(bus.clone(), StoreConfig::default())
            .await
            .unwrap();
        let coordinator = RegistrationCoordinator::start(BridgeComponents {
            store,
            topics: Arc::new(TopicManager::new(
                Arc::new(InMemoryTopicAdmin::new(1)),
                schemas.clone(),
                TopicSettings::default(),
            )),
            correlation: RequestResponseHandler::new(bus, CorrelationConfig::default()),
            servers: ProtocolServers::shared(server.clone()),
            metrics: Some(metrics.clone()),
        })
        .unwrap();
        coordinator.wait_until_loaded().await;

        Fixture {
            schemas,
            server,
            coordinator,
            metrics,
        }
    }

    async fn with_schemas(store: &InMemorySchemaStore, registration: &Registration) {
        for topic in [&registration.request_topic_name, &registration.response_topic_name] {
            store
                .register_schema(&SchemaSide::Value.subject(topic), r#"{"type":"object"}"#)
                .await
                .unwrap();
        }
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    impl Fixture {
        fn correlation(&self) -> &Arc<RequestResponseHandler> {
            &self.coordinator.components.correlation
        }
    }

    #[tokio::test]
    async fn test_register_activates_handler() {
        let fx = fixture().await;
        let sum = Registration::tool("sum", "adds", "sum-req", "sum-res");
        with_schemas(&fx.schemas, &sum).await;

        fx.coordinator.register(&sum).await.unwrap();
        eventually(|| fx.coordinator.is_active("sum")).await;

        assert!(fx.coordinator.is_registered("sum"));
        assert!(fx.server.descriptor(CapabilityKind::Tool, "sum").is_some());
        assert_eq!(fx.metrics.active_registrations.get(), 1);
    }

    fn event_count(metrics: &BridgeMetrics, event: &str) -> u64 {
        metrics
            .registration_events_total
            .get_or_create(&RegistrationEventLabels {
                event: event.to_string(),
                kind: "tool".to_string(),
            })
            .get()
    }

    #[tokio::test]
    async fn test_identical_reregistration_is_idempotent() {
        let fx = fixture().await;
        let sum = Registration::tool("sum", "adds", "sum-req", "sum-res");
        with_schemas(&fx.schemas, &sum).await;

        fx.coordinator.register(&sum).await.unwrap();
        eventually(|| fx.coordinator.is_active("sum")).await;
        fx.coordinator.register(&sum).await.unwrap();
        eventually(|| event_count(&fx.metrics, "duplicate") == 1).await;

        assert_eq!(fx.coordinator.get_all_registration_handlers().len(), 1);
        assert_eq!(fx.server.registration_count(), 1);
        assert_eq!(fx.server.unregistration_count(), 0);
    }

    #[tokio::test]
    async fn test_changed_registration_replaces_handler() {
        let fx = fixture().await;
        let sum = Registration::tool("sum", "adds", "sum-req", "sum-res");
        with_schemas(&fx.schemas, &sum).await;

        fx.coordinator.register(&sum).await.unwrap();
        eventually(|| fx.coordinator.is_active("sum")).await;

        let mut changed = sum.clone();
        changed.description = "adds two integers".to_string();
        fx.coordinator.register(&changed).await.unwrap();
        eventually(|| {
            fx.coordinator
                .handler("sum")
                .is_some_and(|handler| handler.registration().description == "adds two integers")
        })
        .await;

        let descriptor = fx.server.descriptor(CapabilityKind::Tool, "sum").unwrap();
        assert_eq!(descriptor.description, "adds two integers");
        assert_eq!(fx.coordinator.get_all_registration_handlers().len(), 1);
        assert_eq!(fx.server.registration_count(), 2);
        assert_eq!(fx.server.unregistration_count(), 1);
        assert_eq!(fx.metrics.active_registrations.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_activation_retried_on_identical_announcement() {
        let fx = fixture().await;
        let sum = Registration::tool("sum", "adds", "sum-req", "sum-res");

        // No schemas yet: initialize fails and the name stays unseen.
        fx.coordinator.register(&sum).await.unwrap();
        eventually(|| event_count(&fx.metrics, "activation_failed") == 1).await;
        assert!(fx.coordinator.is_registered("sum"));
        assert!(!fx.coordinator.is_active("sum"));
        assert!(!fx.correlation().is_consuming("sum-res"));

        // The agent comes back and announces exactly the same registration.
        with_schemas(&fx.schemas, &sum).await;
        fx.coordinator.register(&sum).await.unwrap();
        eventually(|| fx.coordinator.is_active("sum")).await;
        assert!(fx.correlation().is_routed("sum-res", "sum"));
    }

    #[tokio::test]
    async fn test_tombstone_tears_down() {
        let fx = fixture().await;
        let sum = Registration::tool("sum", "adds", "sum-req", "sum-res");
        with_schemas(&fx.schemas, &sum).await;

        fx.coordinator.register(&sum).await.unwrap();
        eventually(|| fx.coordinator.is_active("sum")).await;

        fx.coordinator.unregister("sum").await.unwrap();
        eventually(|| !fx.coordinator.is_active("sum")).await;

        assert!(fx.server.descriptor(CapabilityKind::Tool, "sum").is_none());
        assert!(!fx.correlation().is_consuming("sum-res"));
        assert_eq!(fx.server.unregistration_count(), 1);
        assert_eq!(fx.metrics.active_registrations.get(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_everything() {
        let fx = fixture().await;
        for name in ["a", "b"] {
            let registration =
                Registration::tool(name, "", format!("{name}-req"), format!("{name}-res"));
            with_schemas(&fx.schemas, &registration).await;
            fx.coordinator.register(&registration).await.unwrap();
        }
        eventually(|| fx.coordinator.get_all_registration_handlers().len() == 2).await;

        assert_eq!(fx.coordinator.shutdown().await, 2);
        assert!(fx.coordinator.get_all_registration_handlers().is_empty());
        assert!(fx.server.descriptors(CapabilityKind::Tool).is_empty());
    }
}
