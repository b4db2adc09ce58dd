//! In-process protocol server.
//!
//! Keeps one registry per capability kind and lets callers invoke a listed
//! capability directly. The proxy's REST front end and the standalone mode
//! serve calls through it.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

use crate::error::BridgeError;
use crate::handler::{CallResult, CapabilityDescriptor, OnCall, ProtocolServer};
use crate::registration::CapabilityKind;

struct Listed {
    descriptor: CapabilityDescriptor,
    on_call: OnCall,
}

/// Protocol server backed by in-memory registries.
#[derive(Default)]
pub struct InMemoryProtocolServer {
    listed: DashMap<(CapabilityKind, String), Listed>,
    registrations: AtomicUsize,
    unregistrations: AtomicUsize,
    calls: AtomicUsize,
    no_unregister: bool,
    reject: AtomicBool,
}

impl std::fmt::Debug for InMemoryProtocolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProtocolServer")
            .field("listed", &self.listed.len())
            .field("registrations", &self.registration_count())
            .field("calls", &self.call_count())
            .finish()
    }
}

impl InMemoryProtocolServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A server that cannot remove listed capabilities.
    #[must_use]
    pub fn without_unregister() -> Self {
        Self {
            no_unregister: true,
            ..Self::default()
        }
    }

    /// Makes every subsequent registration fail (`true`) or succeed.
    pub fn reject_registrations(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    #[must_use]
    pub fn descriptor(&self, kind: CapabilityKind, name: &str) -> Option<CapabilityDescriptor> {
        self.listed
            .get(&(kind, name.to_string()))
            .map(|listed| listed.descriptor.clone())
    }

    /// Descriptors listed for `kind`, sorted by name.
    #[must_use]
    pub fn descriptors(&self, kind: CapabilityKind) -> Vec<CapabilityDescriptor> {
        let mut descriptors: Vec<_> = self
            .listed
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Successful `register_capability` calls so far.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn unregistration_count(&self) -> usize {
        self.unregistrations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Invokes a listed capability. `None` if nothing is listed under `name`.
    pub async fn call(&self, kind: CapabilityKind, name: &str, raw: Value) -> Option<CallResult> {
        let on_call = self
            .listed
            .get(&(kind, name.to_string()))
            .map(|listed| listed.on_call.clone())?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(on_call(raw).await)
    }
}

#[async_trait]
impl ProtocolServer for InMemoryProtocolServer {
    async fn register_capability(
        &self,
        descriptor: CapabilityDescriptor,
        on_call: OnCall,
    ) -> Result<(), BridgeError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(BridgeError::ServerRegistration {
                name: descriptor.name,
                reason: "server is rejecting registrations".to_string(),
            });
        }

        match self.listed.entry((descriptor.kind, descriptor.name.clone())) {
            Entry::Occupied(_) => Err(BridgeError::ServerRegistration {
                name: descriptor.name,
                reason: "already registered".to_string(),
            }),
            Entry::Vacant(slot) => {
                debug!(name = %descriptor.name, kind = %descriptor.kind, "Capability listed");
                slot.insert(Listed {
                    descriptor,
                    on_call,
                });
                self.registrations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn unregister_capability(&self, kind: CapabilityKind, name: &str) -> Result<(), BridgeError> {
        if self.no_unregister {
            return Err(BridgeError::Unsupported {
                name: name.to_string(),
                reason: "server cannot remove capabilities".to_string(),
            });
        }
        if self.listed.remove(&(kind, name.to_string())).is_none() {
            return Err(BridgeError::ServerRegistration {
                name: name.to_string(),
                reason: "not registered".to_string(),
            });
        }
        self.unregistrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_unregister(&self) -> bool {
        !self.no_unregister
    }
}
