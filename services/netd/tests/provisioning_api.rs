//! Provisioning API integration tests.
//!
//! Serves the full router over TCP with the in-memory link backend and
//! drives it the way a VM launcher would.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::{rngs::StdRng, SeedableRng};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use vmnet_netd::{
    api,
    network::{
        mock::{MockBackend, MockOp},
        LinkBackend, LinkKind, Readiness, SharedLedger,
    },
    state::AppState,
};
use vmnet_networking::AddressAllocator;

/// Test harness for provisioning API tests.
struct ProvisioningTestHarness {
    base_url: String,
    client: reqwest::Client,
    mock: Arc<MockBackend>,
}

impl ProvisioningTestHarness {
    async fn new() -> Self {
        Self::with_allocator(AddressAllocator::default_range()).await
    }

    async fn with_allocator(allocator: AddressAllocator) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,vmnet_netd=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let mock = Arc::new(MockBackend::with_uplink("eth0"));
        let ledger = SharedLedger::new(allocator, StdRng::seed_from_u64(42));
        let readiness = Readiness {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        };
        let state = AppState::new(mock.clone(), ledger, readiness);
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            mock,
        }
    }

    async fn post(&self, path: &str, body: Value) -> Value {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        resp.json().await.unwrap()
    }

    async fn create_bridge(&self, bridge: &str, uplink: &str) -> Value {
        self.post(
            "/create-bridge",
            json!({ "bridge_name": bridge, "host_interface": uplink }),
        )
        .await
    }

    async fn create_tap(&self, bridge: &str) -> Value {
        self.post("/create-tap", json!({ "bridge_name": bridge })).await
    }

    async fn bridges(&self) -> Vec<Value> {
        self.client
            .get(format!("{}/bridges", self.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_bridge_then_taps() {
    let h = ProvisioningTestHarness::new().await;

    let bridge = h.create_bridge("br0", "eth0").await;
    assert!(bridge.get("error").is_none(), "unexpected error: {bridge}");
    assert_eq!(bridge["bridge"], "br0");

    let user_id = bridge["user_id"].as_str().unwrap();
    assert_eq!(user_id.len(), 5);
    assert!(user_id.chars().all(|c| c.is_ascii_alphanumeric()));

    let subnet = bridge["bridge_ip_address"].as_str().unwrap();
    assert!(subnet.starts_with("10."));
    assert!(subnet.ends_with(".0/24"));

    let gateway: Ipv4Addr = bridge["bridge_gateway_ip"].as_str().unwrap().parse().unwrap();
    assert_eq!(gateway.octets()[3], 1);
    assert!(subnet.starts_with(&format!(
        "{}.{}.{}.",
        gateway.octets()[0],
        gateway.octets()[1],
        gateway.octets()[2]
    )));

    assert!(h.mock.has_masquerade("br0"));
    assert!(h.mock.has_masquerade("eth0"));
    assert!(h.mock.forwarding_enabled());

    let taps = h.create_tap("br0").await;
    assert!(taps.get("error").is_none(), "unexpected error: {taps}");
    assert_eq!(taps["bridge"], "br0");
    assert_eq!(taps["tap_name_1"], "tap-br0-1");
    assert_eq!(taps["tap_name_2"], "tap-br0-2");

    for name in ["tap-br0-1", "tap-br0-2"] {
        let link = h.mock.link(name).unwrap();
        assert_eq!(link.kind, LinkKind::Tap);
        assert_eq!(link.master.as_deref(), Some("br0"));
    }
}

#[tokio::test]
async fn test_tap_for_missing_bridge() {
    let h = ProvisioningTestHarness::new().await;

    let taps = h.create_tap("br7").await;
    assert_eq!(taps["tap_name_1"], "");
    assert_eq!(taps["tap_name_2"], "");
    assert!(taps["error"]
        .as_str()
        .unwrap()
        .contains("failed to get bridge link br7"));
    assert_eq!(h.mock.link_names(), vec!["eth0"]);
}

#[tokio::test]
async fn test_failed_bridge_is_rolled_back() {
    let h = ProvisioningTestHarness::new().await;
    h.mock.fail(MockOp::AddAddress, "br0");

    let bridge = h.create_bridge("br0", "eth0").await;
    assert_eq!(bridge["bridge"], "");
    assert_eq!(bridge["user_id"], "");
    assert!(bridge["error"]
        .as_str()
        .unwrap()
        .starts_with("failed to assign IP address"));

    assert!(h.mock.link("br0").is_none());
    assert!(h.bridges().await.is_empty());

    // The name is free again once the failure is cleared.
    h.mock.clear_failure(MockOp::AddAddress, "br0");
    let bridge = h.create_bridge("br0", "eth0").await;
    assert!(bridge.get("error").is_none());
}

#[tokio::test]
async fn test_missing_uplink() {
    let h = ProvisioningTestHarness::new().await;

    let bridge = h.create_bridge("br0", "eth9").await;
    assert!(bridge["error"]
        .as_str()
        .unwrap()
        .contains("failed to get host interface eth9"));
    assert!(h.mock.link("br0").is_none());
    assert!(!h.mock.has_masquerade("br0"));
}

#[tokio::test]
async fn test_bridge_listing_tracks_allocations() {
    let h = ProvisioningTestHarness::with_allocator(
        AddressAllocator::from_range("172.16.0.0", "172.16.1.255").unwrap(),
    )
    .await;

    let a = h.create_bridge("br0", "eth0").await;
    let b = h.create_bridge("br1", "eth0").await;
    assert_ne!(a["bridge_ip_address"], b["bridge_ip_address"]);

    let exhausted = h.create_bridge("br2", "eth0").await;
    assert!(exhausted["error"].as_str().is_some());
    assert!(h.mock.link("br2").is_none());

    let records = h.bridges().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["bridge"], "br0");
    assert_eq!(records[0]["subnet"], a["bridge_ip_address"]);
    assert_eq!(records[0]["gateway"], a["bridge_gateway_ip"]);
    assert!(records[0]["host_address"].as_str().unwrap().ends_with(".7"));
    assert!(records[0]["allocated_at"].as_str().is_some());
    assert_eq!(records[1]["bridge"], "br1");
}

#[tokio::test]
async fn test_duplicate_bridge_is_rejected() {
    let h = ProvisioningTestHarness::new().await;

    h.create_bridge("br0", "eth0").await;
    let again = h.create_bridge("br0", "eth0").await;
    assert!(again["error"].as_str().is_some());
    assert_eq!(h.bridges().await.len(), 1);
    assert!(h.mock.link("br0").is_some());
}

#[tokio::test]
async fn test_bridge_deleted_on_host_is_recreated() {
    let h = ProvisioningTestHarness::new().await;

    let first = h.create_bridge("br0", "eth0").await;
    assert!(first.get("error").is_none());
    h.mock.delete_link("br0").await.unwrap();

    let second = h.create_bridge("br0", "eth0").await;
    assert!(second.get("error").is_none(), "unexpected error: {second}");
    assert_eq!(second["bridge"], "br0");
    assert!(h.mock.link("br0").is_some());

    let records = h.bridges().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["user_id"], second["user_id"]);
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = ProvisioningTestHarness::new().await;

    let resp = h
        .client
        .get(format!("{}/healthz", h.base_url))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "netd");

    let resp = h
        .client
        .get(format!("{}/livez", h.base_url))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}
