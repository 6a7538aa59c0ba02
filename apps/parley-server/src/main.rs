//! Parley presence server.
//!
//! Usage: `parley-server [--write-config]`. With `--write-config` the
//! resolved settings are saved to the settings file and the process exits.

mod config;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use parley_presence_server::{InMemoryRegistry, PresenceServer, TrustClaim};

use config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = config::config_path();
    let mut cfg = AppConfig::load(&path)
        .with_context(|| format!("reading settings from {}", path.display()))?;
    cfg.apply_port_override(std::env::var("PORT").ok().as_deref());

    if std::env::args().skip(1).any(|arg| arg == "--write-config") {
        cfg.save(&path)?;
        tracing::info!(path = %path.display(), "settings written");
        return Ok(());
    }

    tracing::info!(
        settings = %path.display(),
        port = cfg.port,
        close_superseded = cfg.close_superseded,
        "starting parley presence server"
    );

    let registry = Arc::new(InMemoryRegistry::new());
    let server = PresenceServer::new(cfg.server_config(), TrustClaim, registry);

    let on_signal = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let online = on_signal.online_users().await.len();
                tracing::info!(
                    online,
                    connections = on_signal.connection_count(),
                    "interrupt received, shutting down"
                );
                on_signal.shutdown();
            }
            Err(e) => tracing::error!("failed to listen for ctrl-c: {e}"),
        }
    });

    server.run().await.context("presence server failed")?;
    Ok(())
}
