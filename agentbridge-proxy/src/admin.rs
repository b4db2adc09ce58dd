//! Admin server: health, readiness, metrics, control API and the REST front
//! end.
//!
//! - `GET /health`, `GET /ready`: lifecycle probes
//! - `GET /metrics`: OpenMetrics text from prometheus-client
//! - `/control/...`: registration management, see [`crate::control`]
//! - `POST /agents/{name}`: REST capabilities, see [`crate::rest`]

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use agentbridge_core::config::AdminConfig;
use agentbridge_core::coordinator::RegistrationCoordinator;
use agentbridge_core::lifecycle::{LifecycleManager, health_router};
use agentbridge_core::memory::InMemoryProtocolServer;

use crate::control::control_router;
use crate::rest::{RestState, rest_router};

/// Shared state for the admin server.
#[derive(Clone)]
pub struct AdminState {
    pub lifecycle: Arc<LifecycleManager>,
    pub prom_registry: Arc<Registry>,
    pub coordinator: Arc<RegistrationCoordinator>,
    /// Server holding listed REST capabilities
    pub rest: Arc<InMemoryProtocolServer>,
}

pub struct AdminServer {
    addr: SocketAddr,
    state: AdminState,
}

impl AdminServer {
    /// An unparsable `admin.bind` falls back to all interfaces.
    pub fn new(config: &AdminConfig, state: AdminState) -> Self {
        let addr = config
            .socket_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.port)));
        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Probes, metrics, control API and REST front end on one router.
    pub fn router(&self) -> Router {
        let metrics = Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(self.state.prom_registry.clone());

        health_router(self.state.lifecycle.clone())
            .merge(metrics)
            .merge(control_router(self.state.coordinator.clone()))
            .merge(rest_router(RestState {
                server: self.state.rest.clone(),
                lifecycle: self.state.lifecycle.clone(),
            }))
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %listener.local_addr()?, "Admin server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        info!("Admin server stopped");
        Ok(())
    }
}

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

async fn render_metrics(State(registry): State<Arc<Registry>>) -> Response {
    let mut text = String::new();
    match prometheus_client::encoding::text::encode(&mut text, &registry) {
        Ok(()) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], text).into_response(),
        Err(e) => {
            error!(error = %e, "Metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
