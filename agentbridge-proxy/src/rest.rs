//! REST front end: `POST /agents/{name}` calls the `rest` capability
//! listed under `name`.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use agentbridge_core::CapabilityKind;
use agentbridge_core::handler::CallResult;
use agentbridge_core::lifecycle::LifecycleManager;
use agentbridge_core::memory::InMemoryProtocolServer;

use crate::error::{ProxyError, ProxyResult};

#[derive(Clone)]
pub struct RestState {
    pub server: Arc<InMemoryProtocolServer>,
    pub lifecycle: Arc<LifecycleManager>,
}

pub fn rest_router(state: RestState) -> Router {
    Router::new()
        .route("/agents/{name}", post(call_agent))
        .with_state(state)
}

async fn call_agent(
    State(state): State<RestState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ProxyResult<Response> {
    let Some(_guard) = state.lifecycle.begin_call() else {
        return Err(ProxyError::ShuttingDown);
    };

    let raw = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ProxyError::BadRequest(format!("body is not JSON: {e}")))?
    };

    let result = state
        .server
        .call(CapabilityKind::Rest, &name, raw)
        .await
        .ok_or_else(|| ProxyError::UnknownAgent { name: name.clone() })?;

    Ok(match result {
        CallResult::Rest { status, body } => {
            debug!(agent = %name, status, "REST call completed");
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(body)).into_response()
        }
        other => {
            warn!(agent = %name, result = ?other, "REST agent produced a non-REST result");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "unexpected_result", "message": "agent did not produce a REST result" })),
            )
                .into_response()
        }
    })
}
