//! Materialized view of the registration log.
//!
//! The registration topic is compacted: its latest record per key is the
//! current announcement for that capability, a tombstone means it was
//! withdrawn. [`RegistrationStore`] tails the topic from the beginning and
//! keeps the latest value per key.
//!
//! ## Catch-up
//!
//! The subscription reports the topic's end offsets at subscribe time. Every
//! record below those offsets is folded into an accumulator instead of being
//! forwarded; once all partitions are caught up the store emits
//! [`StoreEvent::InitialLoadComplete`] followed by a single
//! [`StoreEvent::Update`] carrying the accumulated map. After that each
//! record becomes its own `Update`.
//!
//! A live record repeating the materialized value is still forwarded: it is
//! how an agent re-announces a capability whose activation failed, and the
//! coordinator treats it as a no-op for names it already serves. Tombstones
//! for keys that are not materialized are dropped.
//!
//! The view holds at most `max_entries` registrations. Records for new keys
//! beyond that are refused with a warning, never evicted silently, so the
//! view and the coordinator's active set stay in agreement.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::{BusRecord, MessageBus, StartFrom, Subscription};
use crate::cache::{CacheConfig, CorrelationCache};
use crate::error::BridgeError;
use crate::registration::{Registration, RegistrationKey};

/// Default name of the compacted registration topic.
pub const DEFAULT_REGISTRY_TOPIC: &str = "_agent_registry";

/// Changes observed on the registration log.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The catch-up load finished with `count` live registrations.
    InitialLoadComplete { count: usize },
    /// Keys whose value changed. `None` means the registration was removed.
    Update(IndexMap<RegistrationKey, Option<Registration>>),
}

/// Settings for the registration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub topic: String,
    /// Upper bound on materialized registrations
    pub max_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_REGISTRY_TOPIC.to_string(),
            max_entries: 10_000,
        }
    }
}

/// Continuously updated view of all registrations.
pub struct RegistrationStore {
    bus: Arc<dyn MessageBus>,
    topic: String,
    max_entries: usize,
    view: CorrelationCache<RegistrationKey, Registration>,
    events: Mutex<Option<mpsc::UnboundedReceiver<StoreEvent>>>,
    loaded: watch::Sender<bool>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for RegistrationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationStore")
            .field("topic", &self.topic)
            .field("registrations", &self.view.len())
            .field("loaded", &*self.loaded.borrow())
            .finish()
    }
}

impl RegistrationStore {
    /// Subscribes to the registration topic and starts materializing it.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        config: StoreConfig,
    ) -> Result<Arc<Self>, BridgeError> {
        let subscription = bus.subscribe(&config.topic, StartFrom::Earliest).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (loaded, _) = watch::channel(false);

        let store = Arc::new(Self {
            bus,
            topic: config.topic.clone(),
            max_entries: config.max_entries,
            // Capacity is enforced on admission in `apply`, never by eviction.
            view: CorrelationCache::new(CacheConfig {
                max_entries: usize::MAX,
                expire_after_write: None,
            }),
            events: Mutex::new(Some(events_rx)),
            loaded,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        info!(
            topic = %config.topic,
            end_offsets = ?subscription.end_offsets(),
            "Loading registrations"
        );
        store
            .tasks
            .spawn(consume_log(store.clone(), subscription, events_tx));
        Ok(store)
    }

    /// Takes the event stream. Only the first caller gets it.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<StoreEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Every materialized registration.
    #[must_use]
    pub fn get_all(&self) -> Vec<Registration> {
        let mut all = self.view.values();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    #[must_use]
    pub fn get(&self, key: &RegistrationKey) -> Option<Registration> {
        self.view.get(key)
    }

    #[must_use]
    pub fn is_registered(&self, key: &RegistrationKey) -> bool {
        self.view.contains_key(key)
    }

    /// Publishes `registration` to the log.
    ///
    /// The local view changes only when the record is read back.
    pub async fn register(&self, registration: &Registration) -> Result<(), BridgeError> {
        registration.validate()?;
        let key = serde_json::to_value(registration.key())?;
        let value = serde_json::to_value(registration)?;
        self.bus.publish(&self.topic, key, Some(value)).await?;
        debug!(registration = %registration.name, "Registration published");
        Ok(())
    }

    /// Publishes a tombstone for `key`.
    pub async fn unregister(&self, key: &RegistrationKey) -> Result<(), BridgeError> {
        let key_value = serde_json::to_value(key)?;
        self.bus.publish(&self.topic, key_value, None).await?;
        debug!(registration = %key, "Registration tombstone published");
        Ok(())
    }

    #[must_use]
    pub fn initial_load_complete(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Resolves once the catch-up load has finished.
    pub async fn wait_until_loaded(&self) {
        let mut loaded = self.loaded.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = loaded.wait_for(|done| *done).await;
    }

    /// Stops tailing the log.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(topic = %self.topic, "Registration store stopped");
    }

    // ========================================================================
    // Materialization
    // ========================================================================

    /// Applies one record to the view. Returns the change to forward, or
    /// `None` when the record changes nothing.
    fn apply(
        &self,
        key: RegistrationKey,
        value: Option<Registration>,
    ) -> Option<(RegistrationKey, Option<Registration>)> {
        match value {
            Some(registration) => match self.view.get(&key) {
                Some(current) if current == registration => {
                    debug!(registration = %key, "Registration re-announced");
                    Some((key, Some(registration)))
                }
                Some(_) => {
                    self.view.insert(key.clone(), registration.clone());
                    Some((key, Some(registration)))
                }
                None if self.view.len() >= self.max_entries => {
                    warn!(
                        registration = %key,
                        max_entries = self.max_entries,
                        "Registration view is full, refusing new registration"
                    );
                    None
                }
                None => {
                    self.view.insert(key.clone(), registration.clone());
                    Some((key, Some(registration)))
                }
            },
            None => {
                if self.view.remove(&key).is_none() {
                    debug!(registration = %key, "Tombstone for unknown registration ignored");
                    return None;
                }
                Some((key, None))
            }
        }
    }

    fn finish_initial_load(
        &self,
        mut accumulated: IndexMap<RegistrationKey, Registration>,
        events: &mpsc::UnboundedSender<StoreEvent>,
    ) {
        if accumulated.len() > self.max_entries {
            warn!(
                topic = %self.topic,
                registrations = accumulated.len(),
                max_entries = self.max_entries,
                "Registration log exceeds registry.max_entries, refusing the newest keys"
            );
            accumulated.truncate(self.max_entries);
        }
        for (key, registration) in &accumulated {
            self.view.insert(key.clone(), registration.clone());
        }
        let count = accumulated.len();
        if count == 0 {
            info!(topic = %self.topic, "Registry is empty");
        } else {
            info!(topic = %self.topic, count, "Registrations loaded");
        }

        let _ = events.send(StoreEvent::InitialLoadComplete { count });
        if count > 0 {
            let update = accumulated
                .into_iter()
                .map(|(key, registration)| (key, Some(registration)))
                .collect();
            let _ = events.send(StoreEvent::Update(update));
        }
        self.loaded.send_replace(true);
    }
}

/// Tracks how far each partition is from its end offset at subscribe time.
#[derive(Debug)]
struct CatchUp {
    remaining: HashMap<i32, i64>,
}

impl CatchUp {
    fn new(end_offsets: &HashMap<i32, i64>) -> Self {
        Self {
            remaining: end_offsets
                .iter()
                .filter(|&(_, &end)| end > 0)
                .map(|(&partition, &end)| (partition, end))
                .collect(),
        }
    }

    fn is_done(&self) -> bool {
        self.remaining.is_empty()
    }

    /// True if the record is part of the catch-up load.
    fn observe(&mut self, partition: i32, offset: i64) -> bool {
        let Some(&end) = self.remaining.get(&partition) else {
            return false;
        };
        if offset + 1 >= end {
            self.remaining.remove(&partition);
        }
        offset < end
    }
}

/// Decodes a log record. Records that cannot be decoded yield `None`.
fn materialize(record: &BusRecord) -> Option<(RegistrationKey, Option<Registration>)> {
    let key = match serde_json::from_value::<RegistrationKey>(record.key.clone()) {
        Ok(key) => key,
        Err(e) => {
            warn!(
                topic = %record.topic,
                offset = record.offset,
                error = %e,
                "Skipping registration record with an invalid key"
            );
            return None;
        }
    };

    let Some(value) = &record.value else {
        return Some((key, None));
    };
    match decode_registration(&key, value) {
        Ok(registration) => Some((key, Some(registration))),
        Err(e) => {
            warn!(
                topic = %record.topic,
                offset = record.offset,
                registration = %key,
                error = %e,
                "Skipping invalid registration record"
            );
            None
        }
    }
}

fn decode_registration(key: &RegistrationKey, value: &Value) -> Result<Registration, BridgeError> {
    let registration: Registration = serde_json::from_value(value.clone())?;
    registration.validate()?;
    if registration.name != key.name {
        return Err(BridgeError::InvalidRegistration {
            reason: format!(
                "record keyed '{}' carries registration '{}'",
                key.name, registration.name
            ),
        });
    }
    Ok(registration)
}

async fn consume_log(
    store: Arc<RegistrationStore>,
    mut subscription: Subscription,
    events: mpsc::UnboundedSender<StoreEvent>,
) {
    let mut catch_up = CatchUp::new(subscription.end_offsets());
    let mut accumulated: IndexMap<RegistrationKey, Registration> = IndexMap::new();

    if catch_up.is_done() {
        store.finish_initial_load(std::mem::take(&mut accumulated), &events);
    }

    loop {
        let record = tokio::select! {
            biased;
            _ = store.shutdown.cancelled() => break,
            record = subscription.recv() => record,
        };
        let Some(record) = record else {
            warn!(topic = %store.topic, "Registration log stream closed");
            break;
        };

        if !store.initial_load_complete() {
            let in_load = catch_up.observe(record.partition, record.offset);
            if in_load {
                match materialize(&record) {
                    Some((key, Some(registration))) => {
                        accumulated.insert(key, registration);
                    }
                    Some((key, None)) => {
                        accumulated.shift_remove(&key);
                    }
                    None => {}
                }
            }
            if catch_up.is_done() {
                store.finish_initial_load(std::mem::take(&mut accumulated), &events);
            }
            if in_load {
                continue;
            }
        }

        let Some((key, value)) = materialize(&record) else {
            continue;
        };
        if let Some((key, value)) = store.apply(key, value) {
            let change = IndexMap::from([(key, value)]);
            if events.send(StoreEvent::Update(change)).is_err() {
                debug!(topic = %store.topic, "Store event receiver dropped");
            }
        }
    }
}
