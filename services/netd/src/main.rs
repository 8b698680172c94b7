//! vmnet network daemon
//!
//! Provisions bridges and tap pairs for microVM instances over HTTP.

use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmnet_netd::{
    api, config,
    network::{mock::MockBackend, IpCommandBackend, LinkBackend, SharedLedger},
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to VMNET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmnet netd");
    info!(
        listen_addr = %config.listen_addr,
        range_start = %config.subnet_range_start,
        range_end = %config.subnet_range_end,
        "Configuration loaded"
    );

    let backend: Arc<dyn LinkBackend> = if config.dev_mode {
        warn!("Dev mode: using in-memory link backend, no host devices will be created");
        Arc::new(MockBackend::with_uplink("eth0"))
    } else {
        Arc::new(IpCommandBackend::new(config.ip_command_config()))
    };

    let ledger = SharedLedger::new(config.allocator()?, StdRng::from_os_rng());
    let state = AppState::new(backend, ledger, config.readiness());

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    });

    if let Err(e) = server.await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("netd shutdown complete");
    Ok(())
}
