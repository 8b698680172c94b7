//! HTTP API handlers and routing.

mod bridge;
mod health;
mod tap;

pub use bridge::{BridgeRecord, BridgeResponse};
pub use tap::TapResponse;

use axum::Router;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .merge(health::routes())
        // Provisioning endpoints
        .merge(bridge::routes())
        .merge(tap::routes())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        // Application state
        .with_state(state)
}
