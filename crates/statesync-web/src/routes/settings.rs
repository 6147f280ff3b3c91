//! Stateful service routes.
//!
//! # Endpoints
//!
//! ### `GET /rest/{service}`
//! Returns the service's current state.
//!
//! ### `POST /rest/{service}`
//! Applies the body to the service and returns the resulting state.
//! A body the service refuses yields 400 and leaves the state unchanged.
//! Every subscriber of the service's push event sees an accepted change.

use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use serde_json::Value;
use statesync_core::EndpointError;
use tracing::debug;

use super::ApiError;
use crate::AppState;

/// Create service routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/:service", get(get_service).post(post_service))
}

/// GET /rest/{service}
async fn get_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let endpoint = state
        .endpoint(&service)
        .ok_or_else(|| ApiError::NotFound(service.clone()))?;
    Ok(Json(endpoint.get()))
}

/// POST /rest/{service}
async fn post_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let endpoint = state
        .endpoint(&service)
        .ok_or_else(|| ApiError::NotFound(service.clone()))?;

    // Update handlers may write to storage.
    let result = tokio::task::spawn_blocking(move || endpoint.post(&payload))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    match result {
        Ok(state) => Ok(Json(state)),
        Err(EndpointError::Rejected) => {
            debug!(service = %service, "rejected update");
            Err(ApiError::BadRequest(format!("invalid {service} payload")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{call, test_app};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_unknown_service() {
        let (app, _) = test_app();
        let (status, body) = call(app, "GET", "/rest/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "nope not found");
    }

    #[tokio::test]
    async fn test_post_updates_service() {
        let (app, service) = test_app();
        let (status, body) = call(
            app,
            "POST",
            "/rest/ntpSettings",
            Some(json!({ "server": "pool.ntp.org" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server"], "pool.ntp.org");
        assert_eq!(body["tz_label"], "Europe/London");
        assert_eq!(service.read_with(|s| s.server.clone()), "pool.ntp.org");
    }

    #[tokio::test]
    async fn test_post_rejected_payload() {
        let (app, service) = test_app();
        let (status, body) = call(
            app,
            "POST",
            "/rest/ntpSettings",
            Some(json!({ "server": "not a host" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
        assert_eq!(service.read_with(|s| s.server.clone()), "time.google.com");
    }

    #[tokio::test]
    async fn test_post_unknown_service() {
        let (app, _) = test_app();
        let (status, _) = call(app, "POST", "/rest/nope", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
