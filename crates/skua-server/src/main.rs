use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;

pub use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Pick the ring crypto provider for rustls before anything builds a TLS
    // config.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("skua-server starting");
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    let server_config = ServerConfig::from_env()
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {}", e))?;
    server_config.log_config();

    let listener = TcpListener::bind(server_config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", server_config.listen_addr))?;

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let auth = Arc::new(server_config.authenticator());
    let server = skua_xmpp::XmppServer::new(
        server_config.to_xmpp_config(),
        auth,
        listener,
        shutdown_token,
    )
    .context("failed to start XMPP server")?;

    server.run().await.context("server terminated with error")?;

    info!("clean shutdown");
    Ok(())
}
