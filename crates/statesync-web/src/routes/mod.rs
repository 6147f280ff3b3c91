//! HTTP route handlers.
//!
//! Routes are grouped by concern:
//! - [`settings`] - `/rest/{service}` for registered stateful services
//! - [`features`] - compiled-in feature flags
//! - [`system`] - NTP and system status

pub mod features;
pub mod settings;
pub mod system;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Router,
};
use thiserror::Error;

use crate::AppState;

/// Create the main Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/rest", settings::routes())
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
}

fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .merge(features::routes())
        .merge(system::routes())
}

/// Errors returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
