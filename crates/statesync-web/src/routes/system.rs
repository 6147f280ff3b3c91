//! Status routes.
//!
//! ### `GET /api/v1/ntp/status`
//! Configured time source and the device's current time, in UTC and in the
//! configured zone. `status` is 1 while time sync is enabled.
//!
//! ### `POST /api/v1/ntp/time`
//! Body `{"local_time": "YYYY-MM-DDTHH:MM:SS"}` in the configured zone.
//! Sets the device clock. Refused with 400 while time sync is enabled.
//!
//! ### `GET /api/v1/system/status`
//! Device name, version, uptime and live push-channel connections.

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::ApiError;
use crate::clock::{format_local, parse_local};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ntp/status", get(ntp_status))
        .route("/ntp/time", post(set_time))
        .route("/system/status", get(system_status))
}

#[derive(Debug, Serialize)]
pub struct NtpStatus {
    pub status: u8,
    pub enabled: bool,
    pub server: String,
    pub tz_label: String,
    pub utc_time: String,
    pub local_time: String,
    pub uptime: u64,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub name: String,
    pub version: String,
    pub uptime: u64,
    pub connections: usize,
    pub services: Vec<String>,
}

/// GET /api/v1/ntp/status
async fn ntp_status(State(state): State<AppState>) -> Result<Json<NtpStatus>, ApiError> {
    ntp_snapshot(&state).map(Json)
}

/// POST /api/v1/ntp/time
async fn set_time(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<NtpStatus>, ApiError> {
    let ntp = state
        .ntp()
        .ok_or_else(|| ApiError::NotFound("ntp".to_string()))?;
    let (enabled, tz_label) = ntp.read_with(|s| (s.enabled, s.tz_label.clone()));
    if enabled {
        return Err(ApiError::BadRequest(
            "time sync is enabled; disable it to set the time".to_string(),
        ));
    }

    let local_time = payload
        .get("local_time")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("local_time is required".to_string()))?;
    let utc = parse_local(local_time, &tz_label)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid local_time {local_time:?}")))?;

    state.clock().set(utc);
    info!(local_time, tz = %tz_label, "device time set");
    ntp_snapshot(&state).map(Json)
}

fn ntp_snapshot(state: &AppState) -> Result<NtpStatus, ApiError> {
    let ntp = state
        .ntp()
        .ok_or_else(|| ApiError::NotFound("ntp".to_string()))?;

    let (enabled, server, tz_label) =
        ntp.read_with(|s| (s.enabled, s.server.clone(), s.tz_label.clone()));
    let now = state.clock().now();

    Ok(NtpStatus {
        status: u8::from(enabled),
        enabled,
        server,
        local_time: format_local(now, &tz_label),
        tz_label,
        utc_time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        uptime: state.uptime_secs(),
    })
}

/// GET /api/v1/system/status
async fn system_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        name: state.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: state.uptime_secs(),
        connections: state.hub().map_or(0, |hub| hub.connection_count()),
        services: state.endpoint_names(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{call, test_app};
    use crate::{create_router, ServerState};
    use axum::http::StatusCode;
    use serde_json::json;
    use statesync_core::{OriginId, StateUpdateResult};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ntp_status() {
        let (app, _) = test_app();
        let (status, body) = call(app, "GET", "/api/v1/ntp/status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], true);
        assert_eq!(body["server"], "time.google.com");
        assert_eq!(body["status"], 1);
        assert!(body["utc_time"].as_str().unwrap().ends_with('Z'));
        assert_eq!(body["local_time"].as_str().unwrap().len(), 19);
    }

    #[tokio::test]
    async fn test_set_time_requires_sync_disabled() {
        let (app, _) = test_app();
        let (status, body) = call(
            app,
            "POST",
            "/api/v1/ntp/time",
            Some(json!({ "local_time": "2030-06-15T13:00:00" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("enabled"));
    }

    #[tokio::test]
    async fn test_set_time_moves_device_clock() {
        let (app, ntp) = test_app();
        ntp.update_with(
            |s| {
                s.enabled = false;
                StateUpdateResult::Changed
            },
            &OriginId::none(),
        );

        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/v1/ntp/time",
            Some(json!({ "local_time": "2030-06-15T13:00:00" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], 0);
        assert!(body["utc_time"]
            .as_str()
            .unwrap()
            .starts_with("2030-06-15T12:00"));

        let (_, body) = call(app, "GET", "/api/v1/ntp/status", None).await;
        assert!(body["local_time"]
            .as_str()
            .unwrap()
            .starts_with("2030-06-15T13:00"));
    }

    #[tokio::test]
    async fn test_set_time_rejects_bad_values() {
        let (app, ntp) = test_app();
        ntp.update_with(
            |s| {
                s.enabled = false;
                StateUpdateResult::Changed
            },
            &OriginId::none(),
        );

        for body in [
            json!({ "local_time": "yesterday" }),
            json!({ "local_time": 12 }),
            json!({}),
        ] {
            let (status, _) = call(app.clone(), "POST", "/api/v1/ntp/time", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_ntp_status_without_ntp() {
        let app = create_router(Arc::new(ServerState::new("bare")));
        let (status, _) = call(app, "GET", "/api/v1/ntp/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_system_status() {
        let (app, _) = test_app();
        let (status, body) = call(app, "GET", "/api/v1/system/status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "test-device");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["services"], json!(["ntpSettings"]));
    }
}
