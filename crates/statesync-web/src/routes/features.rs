//! Feature flag routes.
//!
//! ### `GET /api/v1/features`
//! Returns `{ "<feature>": <enabled>, ... }` so clients can hide what the
//! device was built without, plus `firmware_name`, `firmware_version` and
//! `firmware_built_target`.

use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{Map, Value};

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/features", get(get_features))
}

async fn get_features(State(state): State<AppState>) -> Json<Value> {
    let mut body: Map<String, Value> = state
        .features()
        .iter()
        .map(|(name, enabled)| (name.clone(), Value::Bool(*enabled)))
        .collect();
    body.insert("firmware_name".into(), state.firmware_name().into());
    body.insert("firmware_version".into(), state.firmware_version().into());
    body.insert(
        "firmware_built_target".into(),
        std::env::consts::ARCH.into(),
    );
    Json(Value::Object(body))
}
