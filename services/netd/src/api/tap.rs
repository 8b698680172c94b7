//! Tap endpoints.

use axum::{extract::State, routing::post, Json, Router};
use serde::Serialize;

use crate::network::TapRequest;
use crate::state::AppState;

/// Create tap routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/create-tap", post(create_tap))
}

/// Result of a create-tap call.
///
/// On failure the name fields are empty and `error` is set.
#[derive(Debug, Default, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct TapResponse {
    pub bridge: String,
    pub tap_name_1: String,
    pub tap_name_2: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn create_tap(
    State(state): State<AppState>,
    Json(request): Json<TapRequest>,
) -> Json<TapResponse> {
    let response = match state.taps().provision(&request).await {
        Ok(taps) => TapResponse {
            bridge: taps.bridge_name,
            tap_name_1: taps.tap_name_1,
            tap_name_2: taps.tap_name_2,
            error: None,
        },
        Err(e) => TapResponse {
            error: Some(e.to_string()),
            ..Default::default()
        },
    };
    Json(response)
}
