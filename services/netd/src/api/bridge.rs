//! Bridge endpoints.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::Ipv4Addr;
use vmnet_id::UserId;
use vmnet_networking::AllocationRecord;

use crate::network::BridgeRequest;
use crate::state::AppState;

/// Create bridge routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/create-bridge", post(create_bridge))
        .route("/bridges", get(list_bridges))
}

// =============================================================================
// Response Types
// =============================================================================

/// Result of a create-bridge call.
///
/// On failure every descriptor field is empty and `error` is set.
#[derive(Debug, Default, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct BridgeResponse {
    pub bridge: String,
    pub user_id: String,
    /// Subnet in CIDR notation.
    pub bridge_ip_address: String,
    pub bridge_gateway_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One allocation held by this process.
#[derive(Debug, Serialize)]
pub struct BridgeRecord {
    pub bridge: String,
    pub user_id: UserId,
    /// Subnet in CIDR notation.
    pub subnet: String,
    pub gateway: Ipv4Addr,
    pub host_address: Ipv4Addr,
    pub allocated_at: DateTime<Utc>,
}

impl From<AllocationRecord> for BridgeRecord {
    fn from(record: AllocationRecord) -> Self {
        Self {
            bridge: record.bridge_name,
            user_id: record.user_id,
            subnet: record.allocation.subnet.to_string(),
            gateway: record.allocation.gateway,
            host_address: record.allocation.host_address,
            allocated_at: record.allocated_at.into(),
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_bridge(
    State(state): State<AppState>,
    Json(request): Json<BridgeRequest>,
) -> Json<BridgeResponse> {
    let response = match state.bridges().provision(&request).await {
        Ok(bridge) => BridgeResponse {
            bridge_ip_address: bridge.subnet_cidr(),
            bridge_gateway_ip: bridge.gateway.to_string(),
            user_id: bridge.user_id.to_string(),
            bridge: bridge.bridge_name,
            error: None,
        },
        Err(e) => BridgeResponse {
            error: Some(e.to_string()),
            ..Default::default()
        },
    };
    Json(response)
}

async fn list_bridges(State(state): State<AppState>) -> Json<Vec<BridgeRecord>> {
    Json(
        state
            .ledger()
            .snapshot()
            .into_iter()
            .map(BridgeRecord::from)
            .collect(),
    )
}
