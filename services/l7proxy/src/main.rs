//! gantry L7 proxy.
//!
//! HTTP/HTTPS reverse proxy whose routing table is continuously synchronized
//! from the cluster control plane.
//!
//! This service:
//! - Syncs services, endpoint sets, and TLS secrets into a routing store
//! - Terminates TLS with per-handshake SNI certificate selection
//! - Load-balances requests with sticky cookies and dial-failure retry
//! - Spools request bodies to disk so retries are safe

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gantry_l7proxy::config::Config;
use gantry_l7proxy::proxy::{
    generate_placeholder, server_config, CertResolver, Listener, ListenerPool, ProxyHandler,
    RoutingStore,
};
use gantry_l7proxy::source::{publish_static_routes, ControlPlaneSource};
use gantry_l7proxy::sync;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to GANTRY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    info!("Starting gantry L7 proxy");
    info!(
        http_addr = %config.http_addr,
        https_addr = %config.https_addr,
        control_plane_url = %config.control_plane_url,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        resync_interval_ms = config.resync_interval.as_millis() as u64,
        spool_dir = %config.spool_dir.display(),
        static_routes = config.static_routes.len(),
        "Configuration loaded"
    );

    let store = Arc::new(RoutingStore::new());
    let (sink, streams) = gantry_cluster::event_channels(gantry_cluster::DEFAULT_CHANNEL_CAPACITY);
    sync::spawn_consumers(store.clone(), streams);

    if config.static_routes.is_empty() {
        let source = ControlPlaneSource::new(&config, sink)
            .context("error building control plane source")?;
        tokio::spawn(async move {
            if let Err(error) = source.run().await {
                tracing::error!(error = %error, "control plane source stopped");
            }
        });
    } else {
        publish_static_routes(&sink, &config.static_routes)
            .await
            .context("error publishing static routes")?;
    }

    let placeholder = generate_placeholder().context("error generating placeholder certificate")?;
    let resolver = Arc::new(CertResolver::new(store.clone(), placeholder.certified));
    let tls_config = server_config(resolver);

    let handler = Arc::new(ProxyHandler::new(store, config.spool_dir.clone()));

    let mut pool = ListenerPool::new(handler);
    pool.add(
        Listener::bind(config.http_addr)
            .await
            .context("error binding http listener")?,
    );
    pool.add(
        Listener::bind_tls(config.https_addr, tls_config)
            .await
            .context("error binding https listener")?,
    );

    pool.listen_and_serve().await
}
