//! HTTP route handlers.

pub mod gmm;
pub mod training;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use raptgen_core::Error;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::state::AppState;

/// Runtime error rendered as `{ "detail": ... }`.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) | Error::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "detail": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body of the suspend and resume endpoints.
#[derive(Debug, Deserialize)]
pub struct UuidPayload {
    pub uuid: String,
}

/// Body of the PATCH endpoints. Only `name` is patchable.
#[derive(Debug, Deserialize)]
pub struct PatchPayload {
    #[serde(default)]
    pub target: Option<String>,
    pub value: String,
}

impl PatchPayload {
    fn new_name(&self) -> ApiResult<&str> {
        match self.target.as_deref() {
            Some("name") => Ok(&self.value),
            other => Err(Error::InvalidInput(format!("invalid patch target: {:?}", other)).into()),
        }
    }
}

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(training::routes())
        .merge(gmm::routes())
}
