//! Prometheus metrics using the prometheus-client crate.
//!
//! `BridgeMetrics` registers every bridge metric with a caller-provided
//! registry; the proxy encodes that registry on its `/metrics` endpoint.
//! Components take metrics as `Option<Arc<BridgeMetrics>>` and skip recording
//! when none are wired.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for dispatched requests.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RegistrationLabels {
    pub registration: String,
}

/// Labels for resolved requests.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReplyLabels {
    pub registration: String,
    /// One of `matched`, `late`, `timeout`, `evicted`, `shutdown`,
    /// `publish_failed`, `malformed`
    pub outcome: String,
}

/// Labels for registration lifecycle events.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RegistrationEventLabels {
    /// One of `activated`, `activation_failed`, `duplicate`, `replaced`,
    /// `torn_down`
    pub event: String,
    pub kind: String,
}

/// All bridge metrics.
#[derive(Debug)]
pub struct BridgeMetrics {
    pub requests_dispatched_total: Family<RegistrationLabels, Counter>,
    pub replies_total: Family<ReplyLabels, Counter>,
    pub registration_events_total: Family<RegistrationEventLabels, Counter>,
    pub pending_requests: Gauge,
    pub active_registrations: Gauge,
}

impl BridgeMetrics {
    /// Registers all metrics with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_dispatched_total = Family::<RegistrationLabels, Counter>::default();
        registry.register(
            "agentbridge_requests_dispatched",
            "Requests published to capability request topics",
            requests_dispatched_total.clone(),
        );

        let replies_total = Family::<ReplyLabels, Counter>::default();
        registry.register(
            "agentbridge_replies",
            "Pending requests resolved, by outcome",
            replies_total.clone(),
        );

        let registration_events_total = Family::<RegistrationEventLabels, Counter>::default();
        registry.register(
            "agentbridge_registration_events",
            "Registration coordinator lifecycle events",
            registration_events_total.clone(),
        );

        let pending_requests = Gauge::default();
        registry.register(
            "agentbridge_pending_requests",
            "Requests awaiting a correlated reply",
            pending_requests.clone(),
        );

        let active_registrations = Gauge::default();
        registry.register(
            "agentbridge_active_registrations",
            "Registrations with an active protocol handler",
            active_registrations.clone(),
        );

        Self {
            requests_dispatched_total,
            replies_total,
            registration_events_total,
            pending_requests,
            active_registrations,
        }
    }

    pub fn record_dispatch(&self, registration: &str) {
        self.requests_dispatched_total
            .get_or_create(&RegistrationLabels {
                registration: registration.to_string(),
            })
            .inc();
        self.pending_requests.inc();
    }

    /// Records a resolution. `late` replies never had a pending entry.
    pub fn record_reply(&self, registration: &str, outcome: &str) {
        self.replies_total
            .get_or_create(&ReplyLabels {
                registration: registration.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        if outcome != "late" {
            self.pending_requests.dec();
        }
    }

    pub fn record_registration_event(&self, event: &str, kind: &str) {
        self.registration_events_total
            .get_or_create(&RegistrationEventLabels {
                event: event.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn set_active_registrations(&self, count: usize) {
        self.active_registrations
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let mut registry = Registry::default();
        let metrics = BridgeMetrics::new(&mut registry);

        metrics.record_dispatch("sum");
        metrics.record_reply("sum", "matched");
        metrics.record_reply("sum", "late");
        metrics.record_registration_event("activated", "tool");
        metrics.set_active_registrations(1);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)
            .expect("encoding should succeed");

        assert!(buffer.contains("agentbridge_requests_dispatched_total"));
        assert!(buffer.contains("outcome=\"late\""));
        assert!(buffer.contains("agentbridge_active_registrations 1"));
        assert_eq!(metrics.pending_requests.get(), 0);
    }
}
