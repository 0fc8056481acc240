use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use interpose::{Config, NAME, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        name = NAME,
        version = VERSION,
        addr = %config.listen_addr(),
        mitm_all = config.mitm_all,
        cert_cache = ?config.cert_cache_backend,
        "Starting proxy"
    );

    let proxy = config
        .proxy_builder()?
        .build()
        .context("Failed to build proxy")?;
    info!(ca = ?proxy.ca(), "Certificate authority loaded");

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;

    proxy
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for Ctrl-C");
            }
        })
        .await
        .context("Proxy server failed")?;

    Ok(())
}
