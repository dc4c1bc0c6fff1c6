//! Management API: target registration and inspection.
//!
//! Served on a separate management port so agents never share a listener
//! with proxied inference traffic.
//!
//! | Method | Path           | Description                          |
//! |--------|----------------|--------------------------------------|
//! | POST   | `/api/targets` | Register or update a target (agents) |
//! | GET    | `/api/targets` | List registered targets              |

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::error;

use crate::registrar::{Registrar, TargetRegistration};
use crate::registry::TargetRegistry;

#[derive(Clone)]
pub struct ManagementState {
    pub registrar: Arc<Registrar>,
    pub registry: Arc<TargetRegistry>,
}

pub fn management_router(state: ManagementState) -> Router {
    Router::new()
        .route("/api/targets", get(list_targets).post(register_target))
        .with_state(state)
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn register_target(
    State(state): State<ManagementState>,
    Json(registration): Json<TargetRegistration>,
) -> impl IntoResponse {
    let id = registration.id.clone();

    match state.registrar.register_or_update(registration).await {
        Ok(()) => (
            StatusCode::OK,
            Json(MessageResponse {
                message: format!("registered target {id}"),
            }),
        )
            .into_response(),
        Err(e) => {
            error!(id = %id, error = %e, "Registration failed");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn list_targets(State(state): State<ManagementState>) -> impl IntoResponse {
    Json(state.registry.infos().await)
}
