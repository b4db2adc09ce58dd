//! Request/response correlation over publish/subscribe topics.
//!
//! The bridge has no native request/response primitive: it publishes a
//! request under a fresh correlation id and waits for a reply carrying the
//! same id on the capability's response topic. This module owns that
//! bookkeeping.
//!
//! ## Resolution paths
//!
//! ```text
//!            ┌── reply matched ──────────┐
//! dispatch ──┼── deadline passed (sweep) ┼──► PendingRequest::complete (first wins)
//!            ├── evicted for capacity ───┤
//!            ├── publish failed ─────────┤
//!            └── shutdown ───────────────┘
//! ```
//!
//! Every path goes through the correlation cache: a reply removes the entry
//! explicitly, expiry/capacity/shutdown remove it through the eviction
//! listener. Removal is serialized on the entry's shard lock, so exactly one
//! path ever sees the entry. Replies for ids that are no longer cached are
//! logged and dropped.
//!
//! ## Response routes
//!
//! Each response topic has one consumer and a route table naming the
//! registrations whose replies arrive there. A released registration keeps
//! its route until nothing it sent is still in flight; a topic whose route
//! table empties has its consumer stopped.

mod pending;

pub use pending::{PendingKey, PendingReply, PendingRequest};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusRecord, MessageBus, StartFrom, Subscription};
use crate::cache::{CacheConfig, CorrelationCache, RemovalCause};
use crate::error::BridgeError;
use crate::metrics::BridgeMetrics;
use crate::protocol::{Payload, Request, Response, WorkItems};
use crate::registration::Registration;

type PendingCache = CorrelationCache<PendingKey, Arc<PendingRequest>>;

/// Consumer of one response topic.
struct ResponseRoute {
    /// Registration name to correlation field
    fields: DashMap<String, String>,
    stop: CancellationToken,
}

/// Route tables, shared with the sweeper.
struct Routing {
    routes: DashMap<String, Arc<ResponseRoute>>,
    /// `(topic, registration)` pairs released but possibly still in flight
    retiring: Mutex<HashSet<(String, String)>>,
    /// Serializes route changes
    lock: AsyncMutex<()>,
}

impl Routing {
    /// Drops retired registrations with nothing in flight and stops
    /// consumers left without routes. Callers hold `lock`.
    fn prune(&self, in_flight: &DashMap<String, usize>) {
        let mut retiring = self.retiring.lock().unwrap_or_else(PoisonError::into_inner);
        retiring.retain(|(topic, registration)| {
            if in_flight.get(registration).is_some_and(|count| *count > 0) {
                return true;
            }
            let route = self.routes.get(topic).map(|route| Arc::clone(route.value()));
            if let Some(route) = route {
                route.fields.remove(registration);
            }
            if let Some((_, route)) = self
                .routes
                .remove_if(topic, |_, route| route.fields.is_empty())
            {
                route.stop.cancel();
                info!(topic = %topic, "Response consumer retired");
            }
            false
        });
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Settings for the request/response handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationConfig {
    /// How long a request may wait for its reply (default: 10s)
    pub response_timeout: Duration,
    /// How often overdue requests are swept (default: 100ms)
    pub sweep_interval: Duration,
    /// Maximum in-flight requests before the oldest is evicted (default: 10000)
    pub max_pending: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(100),
            max_pending: 10_000,
        }
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Publishes requests and matches their replies.
pub struct RequestResponseHandler {
    bus: Arc<dyn MessageBus>,
    pending: Arc<PendingCache>,
    /// In-flight count per registration, maintained by the cache listener
    in_flight: Arc<DashMap<String, usize>>,
    routing: Arc<Routing>,
    config: CorrelationConfig,
    metrics: Option<Arc<BridgeMetrics>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for RequestResponseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResponseHandler")
            .field("pending", &self.pending.len())
            .field("routes", &self.routing.routes.len())
            .field("config", &self.config)
            .field("has_metrics", &self.metrics.is_some())
            .finish()
    }
}

impl RequestResponseHandler {
    /// Creates the handler and starts its timeout sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, config: CorrelationConfig) -> Arc<Self> {
        Self::build(bus, config, None)
    }

    /// Same as [`RequestResponseHandler::new`], recording into `metrics`.
    #[must_use]
    pub fn with_metrics(
        bus: Arc<dyn MessageBus>,
        config: CorrelationConfig,
        metrics: Arc<BridgeMetrics>,
    ) -> Arc<Self> {
        Self::build(bus, config, Some(metrics))
    }

    fn build(
        bus: Arc<dyn MessageBus>,
        config: CorrelationConfig,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Arc<Self> {
        let in_flight: Arc<DashMap<String, usize>> = Arc::new(DashMap::new());
        let listener_index = in_flight.clone();
        let listener_metrics = metrics.clone();

        let pending = CorrelationCache::new(CacheConfig {
            max_entries: config.max_pending,
            expire_after_write: Some(config.response_timeout),
        })
        .with_listener(move |key: &PendingKey, entry: &Arc<PendingRequest>, cause| {
            untrack(&listener_index, &key.registration);
            on_pending_removed(key, entry, cause, listener_metrics.as_deref());
        });

        let handler = Arc::new(Self {
            bus,
            pending: Arc::new(pending),
            in_flight,
            routing: Arc::new(Routing {
                routes: DashMap::new(),
                retiring: Mutex::new(HashSet::new()),
                lock: AsyncMutex::new(()),
            }),
            config,
            metrics,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        handler.spawn_sweeper();
        handler
    }

    #[must_use]
    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    fn spawn_sweeper(&self) {
        let pending = self.pending.clone();
        let routing = self.routing.clone();
        let in_flight = self.in_flight.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.sweep_interval;

        self.tasks.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let expired = pending.run_pending_tasks();
                        if expired > 0 {
                            debug!(expired, "Swept overdue requests");
                        }
                        // A route change in progress prunes on its own.
                        if let Ok(_guard) = routing.lock.try_lock() {
                            routing.prune(&in_flight);
                        }
                    }
                }
            }
        });
    }

    // ========================================================================
    // Response routing
    // ========================================================================

    /// Starts consuming `registration`'s response topic.
    ///
    /// One consumer task serves each topic; registrations sharing a topic
    /// share its consumer. Idempotent.
    pub async fn subscribe_responses(&self, registration: &Registration) -> Result<(), BridgeError> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::Shutdown {
                registration: registration.name.clone(),
                reason: "request/response handler is stopped".to_string(),
            });
        }

        let topic = registration.response_topic_name.clone();
        let _guard = self.routing.lock.lock().await;
        self.routing
            .retiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(topic.clone(), registration.name.clone()));

        if let Some(route) = self.routing.routes.get(&topic) {
            route.fields.insert(
                registration.name.clone(),
                registration.correlation_id_field_name.clone(),
            );
            return Ok(());
        }

        let subscription = self.bus.subscribe(&topic, StartFrom::Latest).await?;
        let route = Arc::new(ResponseRoute {
            fields: DashMap::new(),
            stop: self.shutdown.child_token(),
        });
        route.fields.insert(
            registration.name.clone(),
            registration.correlation_id_field_name.clone(),
        );
        self.routing.routes.insert(topic.clone(), route.clone());

        self.tasks.spawn(consume_responses(
            subscription,
            route,
            self.pending.clone(),
            self.metrics.clone(),
        ));
        info!(topic = %topic, registration = %registration.name, "Consuming responses");
        Ok(())
    }

    /// Stops routing replies for `registration` once nothing it sent is
    /// still in flight. Re-subscribing before then cancels the release.
    pub async fn release_responses(&self, registration: &Registration) {
        let _guard = self.routing.lock.lock().await;
        self.routing
            .retiring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((
                registration.response_topic_name.clone(),
                registration.name.clone(),
            ));
        self.routing.prune(&self.in_flight);
    }

    /// True if `topic` has a running consumer.
    #[must_use]
    pub fn is_consuming(&self, topic: &str) -> bool {
        self.routing.routes.contains_key(topic)
    }

    /// True if replies on `topic` are matched for `registration`.
    #[must_use]
    pub fn is_routed(&self, topic: &str, registration: &str) -> bool {
        self.routing
            .routes
            .get(topic)
            .is_some_and(|route| route.fields.contains_key(registration))
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Publishes `payload` to `registration` with the configured timeout.
    pub async fn send_request_response(
        &self,
        registration: &Registration,
        payload: Payload,
    ) -> PendingReply {
        self.send_with_timeout(registration, payload, self.config.response_timeout)
            .await
    }

    /// Publishes `payload` to `registration` and returns the reply waiter.
    ///
    /// The pending entry is cached before the request is published, so a
    /// reply can never beat its waiter. Failures resolve the waiter with an
    /// `ERROR` response rather than returning an error.
    pub async fn send_with_timeout(
        &self,
        registration: &Registration,
        payload: Payload,
        timeout: Duration,
    ) -> PendingReply {
        let request = Request::new(0, payload);

        if self.shutdown.is_cancelled() {
            let err = BridgeError::Shutdown {
                registration: registration.name.clone(),
                reason: "request/response handler is stopped".to_string(),
            };
            return PendingReply::resolved(
                PendingKey::new(registration.name.clone(), String::new()),
                Response::error(&err),
            );
        }

        let (key, reply, remaining) = self.register_pending(registration, request.clone(), timeout);
        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(&registration.name);
        }

        let record_key = correlation_key(&registration.correlation_id_field_name, &key.correlation_id);
        let record_value = match serde_json::to_value(&request) {
            Ok(value) => value,
            Err(e) => {
                self.fail_pending(&key, &BridgeError::from(e), "malformed");
                return reply;
            }
        };

        match self
            .bus
            .publish(&registration.request_topic_name, record_key, Some(record_value))
            .await
        {
            Ok(()) => debug!(
                registration = %registration.name,
                correlation_id = %key.correlation_id,
                topic = %registration.request_topic_name,
                timeout_ms = remaining.as_millis() as u64,
                "Request published"
            ),
            Err(e) => {
                let err = BridgeError::Publish {
                    topic: registration.request_topic_name.clone(),
                    reason: e.to_string(),
                };
                warn!(
                    registration = %registration.name,
                    correlation_id = %key.correlation_id,
                    error = %err,
                    "Failed to publish request"
                );
                self.fail_pending(&key, &err, "publish_failed");
            }
        }
        reply
    }

    fn register_pending(
        &self,
        registration: &Registration,
        request: Request,
        timeout: Duration,
    ) -> (PendingKey, PendingReply, Duration) {
        loop {
            let correlation_id = normalize_correlation_id(&Uuid::new_v4().to_string());
            let key = PendingKey::new(registration.name.clone(), correlation_id);
            let (entry, reply) = PendingRequest::new(key.clone(), request.clone(), timeout);
            let remaining = entry.remaining();

            track(&self.in_flight, &key.registration);
            if self
                .pending
                .try_insert_with_ttl(key.clone(), entry, Some(timeout))
            {
                return (key, reply, remaining);
            }
            untrack(&self.in_flight, &key.registration);
            warn!(
                registration = %registration.name,
                correlation_id = %key.correlation_id,
                "Correlation id collision, regenerating"
            );
        }
    }

    fn fail_pending(&self, key: &PendingKey, err: &BridgeError, outcome: &str) {
        if let Some(entry) = self.pending.remove(key)
            && entry.fail(err)
            && let Some(metrics) = &self.metrics
        {
            metrics.record_reply(&key.registration, outcome);
        }
    }

    /// Times out a pending request immediately. Returns false if it was
    /// already resolved.
    pub fn expire_now(&self, key: &PendingKey) -> bool {
        let Some(entry) = self.pending.remove(key) else {
            return false;
        };
        let resolved = entry.fail(&BridgeError::Timeout {
            registration: key.registration.clone(),
            correlation_id: key.correlation_id.clone(),
            timeout_ms: entry.timeout().as_millis() as u64,
        });
        if resolved && let Some(metrics) = &self.metrics {
            metrics.record_reply(&key.registration, "timeout");
        }
        resolved
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True if the correlation id is still awaiting a reply.
    #[must_use]
    pub fn is_pending(&self, registration: &str, correlation_id: &str) -> bool {
        self.pending.contains_key(&PendingKey::new(
            registration,
            normalize_correlation_id(correlation_id),
        ))
    }

    /// Requests in flight for `registration`.
    #[must_use]
    pub fn in_flight_for(&self, registration: &str) -> usize {
        self.in_flight.get(registration).map(|n| *n).unwrap_or(0)
    }

    /// Exchanges of every in-flight request.
    #[must_use]
    pub fn in_flight(&self) -> Vec<WorkItems> {
        self.pending
            .values()
            .iter()
            .map(|entry| entry.work_items())
            .collect()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops all consumers and fails every pending request.
    ///
    /// Returns the number of requests that were failed.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let failed = self.pending.clear();
        self.tasks.close();
        self.tasks.wait().await;
        info!(failed, "Request/response handler stopped");
        failed
    }
}

// ============================================================================
// Consumer
// ============================================================================

async fn consume_responses(
    mut subscription: Subscription,
    route: Arc<ResponseRoute>,
    pending: Arc<PendingCache>,
    metrics: Option<Arc<BridgeMetrics>>,
) {
    let topic = subscription.topic().to_string();
    loop {
        let record = tokio::select! {
            biased;
            _ = route.stop.cancelled() => break,
            record = subscription.recv() => record,
        };
        let Some(record) = record else {
            warn!(topic = %topic, "Response stream closed");
            break;
        };

        let processed = std::panic::catch_unwind(AssertUnwindSafe(|| {
            dispatch_reply(&record, &route.fields, &pending, metrics.as_deref());
        }));
        if processed.is_err() {
            error!(
                topic = %topic,
                offset = record.offset,
                "Reply processing panicked, skipping record"
            );
        }
    }
    debug!(topic = %topic, "Response consumer stopped");
}

/// Matches one reply record against the pending table.
fn dispatch_reply(
    record: &BusRecord,
    route: &DashMap<String, String>,
    pending: &PendingCache,
    metrics: Option<&BridgeMetrics>,
) {
    let candidates: Vec<(String, String)> = route
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();

    let mut matched_registration = None;
    for (registration, field) in candidates {
        let Some(correlation_id) = correlation_id_from_key(&record.key, &field) else {
            continue;
        };
        let key = PendingKey::new(registration.clone(), correlation_id);
        let Some(entry) = pending.remove(&key) else {
            matched_registration.get_or_insert((registration, key.correlation_id));
            continue;
        };

        let outcome = match decode_reply(record) {
            Ok(response) => {
                debug!(
                    registration = %registration,
                    correlation_id = %key.correlation_id,
                    status = %response.status(),
                    "Reply matched"
                );
                entry.complete(response);
                "matched"
            }
            Err(err) => {
                warn!(
                    registration = %registration,
                    correlation_id = %key.correlation_id,
                    error = %err,
                    "Reply could not be decoded"
                );
                entry.fail(&err);
                "malformed"
            }
        };
        if let Some(metrics) = metrics {
            metrics.record_reply(&registration, outcome);
        }
        return;
    }

    match matched_registration {
        Some((registration, correlation_id)) => {
            warn!(
                topic = %record.topic,
                registration = %registration,
                correlation_id = %correlation_id,
                "No pending request for reply, discarding"
            );
            if let Some(metrics) = metrics {
                metrics.record_reply(&registration, "late");
            }
        }
        None => warn!(
            topic = %record.topic,
            key = %record.key,
            "Reply key carries no correlation id, discarding"
        ),
    }
}

fn decode_reply(record: &BusRecord) -> Result<Response, BridgeError> {
    let value = record
        .value
        .as_ref()
        .ok_or_else(|| BridgeError::MalformedReply {
            topic: record.topic.clone(),
            reason: "reply has no value".to_string(),
        })?;
    serde_json::from_value(value.clone()).map_err(|e| BridgeError::MalformedReply {
        topic: record.topic.clone(),
        reason: e.to_string(),
    })
}

/// Record key `{ <field>: <id> }` addressing one request and its reply.
#[must_use]
pub fn correlation_key(field: &str, correlation_id: &str) -> Value {
    let mut key = serde_json::Map::new();
    key.insert(field.to_string(), Value::String(correlation_id.to_string()));
    Value::Object(key)
}

/// Extracts and normalizes the correlation id from a record key.
///
/// Keys are objects carrying the id under the registration's correlation
/// field; a bare string key is accepted as the id itself.
#[must_use]
pub fn correlation_id_from_key(key: &Value, field: &str) -> Option<String> {
    match key {
        Value::Object(map) => map
            .get(field)
            .and_then(Value::as_str)
            .map(normalize_correlation_id),
        Value::String(id) => Some(normalize_correlation_id(id)),
        _ => None,
    }
}

/// Correlation ids compare case-insensitively.
#[must_use]
pub fn normalize_correlation_id(id: &str) -> String {
    id.trim().to_ascii_lowercase()
}

// ============================================================================
// Eviction listener
// ============================================================================

fn track(index: &DashMap<String, usize>, registration: &str) {
    *index.entry(registration.to_string()).or_insert(0) += 1;
}

fn untrack(index: &DashMap<String, usize>, registration: &str) {
    if let Entry::Occupied(mut entry) = index.entry(registration.to_string()) {
        let count = entry.get_mut();
        *count = count.saturating_sub(1);
        if *count == 0 {
            entry.remove();
        }
    }
}

fn on_pending_removed(
    key: &PendingKey,
    entry: &PendingRequest,
    cause: RemovalCause,
    metrics: Option<&BridgeMetrics>,
) {
    let (err, outcome) = match cause {
        // The remover resolves the entry itself.
        RemovalCause::Explicit => return,
        RemovalCause::Expired => (
            BridgeError::Timeout {
                registration: key.registration.clone(),
                correlation_id: key.correlation_id.clone(),
                timeout_ms: entry.timeout().as_millis() as u64,
            },
            "timeout",
        ),
        RemovalCause::Size | RemovalCause::Replaced => (
            BridgeError::Evicted {
                registration: key.registration.clone(),
                correlation_id: key.correlation_id.clone(),
            },
            "evicted",
        ),
        RemovalCause::Cleared => (
            BridgeError::Shutdown {
                registration: key.registration.clone(),
                reason: "bridge is shutting down".to_string(),
            },
            "shutdown",
        ),
    };

    if entry.fail(&err) {
        warn!(
            registration = %key.registration,
            correlation_id = %key.correlation_id,
            age_ms = (chrono::Utc::now() - entry.created_at()).num_milliseconds(),
            outcome,
            "Pending request resolved without a reply"
        );
        if let Some(metrics) = metrics {
            metrics.record_reply(&key.registration, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBus;
    use crate::protocol::ResponseStatus;
    use prometheus_client::registry::Registry;
    use serde_json::json;

    fn registration() -> Registration {
        Registration::tool("sum", "adds", "sum-req", "sum-res")
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn setup(timeout_ms: u64) -> (Arc<InMemoryBus>, Arc<RequestResponseHandler>) {
        let bus = Arc::new(InMemoryBus::new());
        let handler = RequestResponseHandler::new(
            bus.clone(),
            CorrelationConfig {
                response_timeout: Duration::from_millis(timeout_ms),
                sweep_interval: Duration::from_millis(10),
                max_pending: 100,
            },
        );
        handler.subscribe_responses(&registration()).await.unwrap();
        (bus, handler)
    }

    async fn reply(bus: &InMemoryBus, correlation_id: &str, value: Option<Value>) {
        bus.publish("sum-res", json!({ "correlationId": correlation_id }), value)
            .await
            .unwrap();
    }

    #[test]
    fn test_correlation_id_extraction() {
        let key = json!({"correlationId": "ABC-123"});
        assert_eq!(
            correlation_id_from_key(&key, "correlationId").as_deref(),
            Some("abc-123")
        );
        assert_eq!(correlation_id_from_key(&key, "id"), None);
        assert_eq!(
            correlation_id_from_key(&json!("XyZ"), "ignored").as_deref(),
            Some("xyz")
        );
        assert_eq!(correlation_id_from_key(&json!(42), "id"), None);
    }

    #[tokio::test]
    async fn test_request_published_with_correlation_key() {
        let (bus, handler) = setup(1000).await;
        let reply_future = handler
            .send_request_response(&registration(), payload(json!({"a": 1, "b": 2})))
            .await;

        let records = bus.records("sum-req");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key["correlationId"], reply_future.correlation_id());
        let request: Request = serde_json::from_value(records[0].value.clone().unwrap()).unwrap();
        assert_eq!(request.payload, payload(json!({"a": 1, "b": 2})));
        assert!(handler.is_pending("sum", reply_future.correlation_id()));
    }

    #[tokio::test]
    async fn test_matching_reply_completes_waiter() {
        let (bus, handler) = setup(1000).await;
        let waiter = handler
            .send_request_response(&registration(), payload(json!({"a": 2, "b": 3})))
            .await;
        let id = waiter.correlation_id().to_uppercase();

        reply(
            &bus,
            &id,
            Some(json!({"requestIndex": 0, "status": "COMPLETED", "payload": {"result": 5}})),
        )
        .await;

        let response = waiter.await;
        assert_eq!(response.status(), ResponseStatus::Completed);
        assert_eq!(response.payload().unwrap()["result"], 5);
        assert_eq!(handler.pending_count(), 0);
        assert_eq!(handler.in_flight_for("sum"), 0);
    }

    #[tokio::test]
    async fn test_undecodable_reply_resolves_with_error() {
        let (bus, handler) = setup(1000).await;
        let waiter = handler
            .send_request_response(&registration(), Payload::new())
            .await;
        let id = waiter.correlation_id().to_string();

        reply(&bus, &id, Some(json!({"status": 17}))).await;

        let response = waiter.await;
        assert_eq!(response.status(), ResponseStatus::Error);
        assert_eq!(response.exception().unwrap().class_name, "malformed_reply");
    }

    #[tokio::test]
    async fn test_publish_failure_resolves_with_error() {
        let (bus, handler) = setup(1000).await;
        bus.fail_publishes_to("sum-req");

        let waiter = handler
            .send_request_response(&registration(), Payload::new())
            .await;
        let response = waiter.await;

        assert_eq!(response.status(), ResponseStatus::Error);
        assert_eq!(response.exception().unwrap().class_name, "publish_failed");
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_release_without_in_flight_stops_consumer() {
        let (_bus, handler) = setup(1000).await;
        let sum = registration();
        let other = Registration::tool("other", "", "other-req", "sum-res");
        handler.subscribe_responses(&other).await.unwrap();

        handler.release_responses(&sum).await;
        assert!(!handler.is_routed("sum-res", "sum"));
        assert!(handler.is_consuming("sum-res"));

        handler.release_responses(&other).await;
        assert!(!handler.is_consuming("sum-res"));

        // Subscribing again brings a fresh consumer up.
        handler.subscribe_responses(&sum).await.unwrap();
        assert!(handler.is_routed("sum-res", "sum"));
    }

    #[tokio::test]
    async fn test_released_route_outlives_in_flight_requests() {
        let (bus, handler) = setup(1000).await;
        let waiter = handler
            .send_request_response(&registration(), Payload::new())
            .await;
        let id = waiter.correlation_id().to_string();

        handler.release_responses(&registration()).await;
        assert!(handler.is_routed("sum-res", "sum"));

        reply(
            &bus,
            &id,
            Some(json!({"requestIndex": 0, "status": "completed", "payload": {}})),
        )
        .await;
        assert_eq!(waiter.await.status(), ResponseStatus::Completed);

        // The sweeper retires the route once nothing is in flight.
        tokio::time::timeout(Duration::from_secs(1), async {
            while handler.is_consuming("sum-res") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("route never retired");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_never_fires_early() {
        let (_bus, handler) = setup(200).await;
        let mut waiter = handler
            .send_request_response(&registration(), Payload::new())
            .await;

        tokio::time::advance(Duration::from_millis(190)).await;
        tokio::task::yield_now().await;
        assert!(futures_util::FutureExt::now_or_never(&mut waiter).is_none());

        tokio::time::advance(Duration::from_millis(30)).await;
        let response = waiter.await;
        assert_eq!(response.status(), ResponseStatus::Error);
        assert_eq!(response.exception().unwrap().class_name, "timeout");
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_has_no_effect() {
        let (bus, handler) = setup(100).await;
        let waiter = handler
            .send_request_response(&registration(), Payload::new())
            .await;
        let id = waiter.correlation_id().to_string();

        let response = waiter.await;
        assert_eq!(response.status(), ResponseStatus::Error);

        reply(
            &bus,
            &id,
            Some(json!({"requestIndex": 0, "status": "completed"})),
        )
        .await;
        tokio::task::yield_now().await;
        assert_eq!(handler.pending_count(), 0);
        assert!(!handler.is_pending("sum", &id));
    }

    #[tokio::test]
    async fn test_reply_without_correlation_field_is_discarded() {
        let (bus, handler) = setup(1000).await;
        let _waiter = handler
            .send_request_response(&registration(), Payload::new())
            .await;

        bus.publish("sum-res", json!({"other": "x"}), Some(json!({})))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(handler.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_eviction_fails_oldest() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = RequestResponseHandler::new(
            bus.clone(),
            CorrelationConfig {
                response_timeout: Duration::from_secs(10),
                sweep_interval: Duration::from_millis(10),
                max_pending: 1,
            },
        );

        let first = handler
            .send_request_response(&registration(), Payload::new())
            .await;
        let _second = handler
            .send_request_response(&registration(), Payload::new())
            .await;

        let response = first.await;
        assert_eq!(response.exception().unwrap().class_name, "evicted");
        assert_eq!(handler.pending_count(), 1);
        assert_eq!(handler.in_flight_for("sum"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_requests() {
        let (_bus, handler) = setup(10_000).await;
        let waiter = handler
            .send_request_response(&registration(), Payload::new())
            .await;

        assert_eq!(handler.shutdown().await, 1);
        let response = waiter.await;
        assert_eq!(response.exception().unwrap().class_name, "cancelled");

        let after = handler
            .send_request_response(&registration(), Payload::new())
            .await
            .await;
        assert_eq!(after.status(), ResponseStatus::Error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reply_and_forced_timeout_race_resolves_once() {
        let (bus, handler) = setup(10_000).await;

        for _ in 0..25 {
            let waiter = handler
                .send_request_response(&registration(), Payload::new())
                .await;
            let key = waiter.key().clone();

            let replier = {
                let bus = bus.clone();
                let id = key.correlation_id.clone();
                tokio::spawn(async move {
                    reply(
                        &bus,
                        &id,
                        Some(json!({"requestIndex": 0, "status": "completed"})),
                    )
                    .await;
                })
            };
            let expirer = {
                let handler = handler.clone();
                let key = key.clone();
                tokio::spawn(async move { handler.expire_now(&key) })
            };

            replier.await.unwrap();
            let expired = expirer.await.unwrap();
            let response = waiter.await;

            if expired {
                assert_eq!(response.status(), ResponseStatus::Error);
            } else {
                assert_eq!(response.status(), ResponseStatus::Completed);
            }
            assert!(!handler.is_pending("sum", &key.correlation_id));
        }
    }

    #[tokio::test]
    async fn test_metrics_track_outcomes() {
        let mut registry = Registry::default();
        let metrics = Arc::new(BridgeMetrics::new(&mut registry));
        let bus = Arc::new(InMemoryBus::new());
        let handler = RequestResponseHandler::with_metrics(
            bus.clone(),
            CorrelationConfig::default(),
            metrics.clone(),
        );
        handler.subscribe_responses(&registration()).await.unwrap();

        let waiter = handler
            .send_request_response(&registration(), Payload::new())
            .await;
        assert_eq!(metrics.pending_requests.get(), 1);

        let id = waiter.correlation_id().to_string();
        reply(&bus, &id, Some(json!({"requestIndex": 0, "status": "completed"}))).await;
        waiter.await;
        assert_eq!(metrics.pending_requests.get(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_records_exchange() {
        let (_bus, handler) = setup(1000).await;
        let waiter = handler
            .send_request_response(&registration(), payload(json!({"a": 1})))
            .await;

        let exchanges = handler.in_flight();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].correlation_id(), waiter.correlation_id());
        assert!(!exchanges[0].is_complete());
    }
}
