//! Liveness and readiness probes.
//!
//! `/health` answers 200 for as long as the process has not stopped.
//! `/ready` answers 200 only in the `Ready` state; otherwise 503 with the
//! reason (`shutting_down`, the first unmet condition, or the state itself).

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Condition, LifecycleManager, LifecycleState};

/// Per-condition readiness, serialized as `{"config_loaded": true, ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ReadinessChecks(BTreeMap<&'static str, bool>);

impl ReadinessChecks {
    pub(super) fn from_fn(mut met: impl FnMut(Condition) -> bool) -> Self {
        Self(
            Condition::ALL
                .into_iter()
                .map(|condition| (condition.name(), met(condition)))
                .collect(),
        )
    }

    #[must_use]
    pub fn all_pass(&self) -> bool {
        self.0.values().all(|met| *met)
    }

    /// First unmet condition, in startup order.
    #[must_use]
    pub fn first_failure(&self) -> Option<&'static str> {
        Condition::ALL
            .into_iter()
            .map(|condition| condition.name())
            .find(|name| self.0.get(name) == Some(&false))
    }
}

/// Body shared by both probes.
#[derive(Debug, Serialize)]
struct Probe {
    #[serde(skip)]
    code: StatusCode,
    status: &'static str,
    state: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    checks: Option<ReadinessChecks>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl Probe {
    fn new(lifecycle: &LifecycleManager, code: StatusCode, status: &'static str) -> Self {
        Self {
            code,
            status,
            state: lifecycle.state().as_str(),
            version: lifecycle.version(),
            uptime_seconds: lifecycle.uptime_seconds(),
            checks: None,
            reason: None,
        }
    }
}

impl IntoResponse for Probe {
    fn into_response(self) -> Response {
        (self.code, Json(self)).into_response()
    }
}

/// `GET /health` and `GET /ready`.
pub fn health_router(lifecycle: Arc<LifecycleManager>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .with_state(lifecycle)
}

async fn liveness(State(lifecycle): State<Arc<LifecycleManager>>) -> Probe {
    if lifecycle.state() == LifecycleState::Stopped {
        let mut probe = Probe::new(&lifecycle, StatusCode::SERVICE_UNAVAILABLE, "unhealthy");
        probe.reason = Some("service_stopped".to_string());
        return probe;
    }
    Probe::new(&lifecycle, StatusCode::OK, "healthy")
}

async fn readiness(State(lifecycle): State<Arc<LifecycleManager>>) -> Probe {
    let checks = lifecycle.readiness_checks();
    let reason = if lifecycle.is_shutting_down() {
        Some("shutting_down".to_string())
    } else if let Some(unmet) = checks.first_failure() {
        Some(unmet.to_string())
    } else if !lifecycle.is_ready() {
        Some(format!("lifecycle_state: {}", lifecycle.state()))
    } else {
        None
    };

    let mut probe = match reason {
        None => Probe::new(&lifecycle, StatusCode::OK, "ready"),
        Some(_) => Probe::new(&lifecycle, StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
    };
    probe.checks = Some(checks);
    probe.reason = reason;
    probe
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn probe(lifecycle: &Arc<LifecycleManager>, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = health_router(lifecycle.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_liveness_until_stopped() {
        let lifecycle = Arc::new(LifecycleManager::new());
        let (status, body) = probe(&lifecycle, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["state"], "starting");

        lifecycle.mark_stopped();
        let (status, body) = probe(&lifecycle, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason"], "service_stopped");
    }

    #[tokio::test]
    async fn test_ready_waits_for_registration_replay() {
        let lifecycle = Arc::new(LifecycleManager::new());
        lifecycle.satisfy(Condition::ConfigLoaded);

        let (status, body) = probe(&lifecycle, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason"], "registrations_loaded");
        assert_eq!(body["checks"]["config_loaded"], true);

        lifecycle.satisfy(Condition::RegistrationsLoaded);
        let (status, body) = probe(&lifecycle, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert!(body.get("reason").is_none());
    }

    #[tokio::test]
    async fn test_not_ready_during_shutdown() {
        let lifecycle = Arc::new(LifecycleManager::new());
        for condition in Condition::ALL {
            lifecycle.satisfy(condition);
        }
        lifecycle.begin_shutdown();

        let (status, body) = probe(&lifecycle, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason"], "shutting_down");
        assert_eq!(body["state"], "shutting_down");
    }
}
