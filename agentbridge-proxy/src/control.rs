//! Control API for registrations.
//!
//! | Method | Path | Result |
//! |--------|------|--------|
//! | GET    | /control/registrations | active registrations |
//! | POST   | /control/registration | 201, or 409 if already registered |
//! | PATCH  | /control/registration | 200, or 404 if unknown |
//! | DELETE | /control/registration/{name} | 204, or 404 if unknown |
//!
//! Writes go to the registration log; handlers follow once the coordinator
//! sees the record.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tracing::info;

use agentbridge_core::Registration;
use agentbridge_core::coordinator::RegistrationCoordinator;

use crate::error::{ProxyError, ProxyResult};

pub fn control_router(coordinator: Arc<RegistrationCoordinator>) -> Router {
    Router::new()
        .route("/control/registrations", get(list_registrations))
        .route(
            "/control/registration",
            post(create_registration).patch(update_registration),
        )
        .route("/control/registration/{name}", delete(delete_registration))
        .with_state(coordinator)
}

async fn list_registrations(
    State(coordinator): State<Arc<RegistrationCoordinator>>,
) -> Json<Vec<Registration>> {
    Json(
        coordinator
            .get_all_registration_handlers()
            .iter()
            .map(|handler| handler.registration().clone())
            .collect(),
    )
}

async fn create_registration(
    State(coordinator): State<Arc<RegistrationCoordinator>>,
    Json(registration): Json<Registration>,
) -> ProxyResult<(StatusCode, Json<Registration>)> {
    if coordinator.is_registered(&registration.name) {
        return Err(ProxyError::Conflict {
            name: registration.name,
        });
    }
    coordinator.register(&registration).await?;
    info!(registration = %registration.name, "Registration created via control API");
    Ok((StatusCode::CREATED, Json(registration)))
}

async fn update_registration(
    State(coordinator): State<Arc<RegistrationCoordinator>>,
    Json(registration): Json<Registration>,
) -> ProxyResult<Json<Registration>> {
    if !coordinator.is_registered(&registration.name) {
        return Err(ProxyError::NotFound {
            name: registration.name,
        });
    }
    coordinator.register(&registration).await?;
    info!(registration = %registration.name, "Registration updated via control API");
    Ok(Json(registration))
}

async fn delete_registration(
    State(coordinator): State<Arc<RegistrationCoordinator>>,
    Path(name): Path<String>,
) -> ProxyResult<StatusCode> {
    if !coordinator.is_registered(&name) {
        return Err(ProxyError::NotFound { name });
    }
    coordinator.unregister(&name).await?;
    info!(registration = %name, "Registration deleted via control API");
    Ok(StatusCode::NO_CONTENT)
}
