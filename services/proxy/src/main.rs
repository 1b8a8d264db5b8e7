// Proxy service main entry point.
mod observability;

use anyhow::{Context, Result};
use proxy::config::ProxyConfig;
use proxy::server;
use relaymux_pool::Pool;
use std::future::Future;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("relaymux-proxy");
    // wss:// relays need a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = ProxyConfig::from_env_or_yaml()?;
    let cache = relaymux_storage::from_endpoint(
        config.cache_url.as_deref(),
        config.cache_max_entries,
        Some(config.cache_sweep_interval()),
    )
    .context("build cache backend")?;

    let pool = Pool::new(config.to_pool_config(), cache);
    pool.start();

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
        pool.clone(),
    ));

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind client listener {}", config.bind))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        relays = ?pool.list_upstream_urls(),
        "proxy listening"
    );
    let accept_task = tokio::spawn(server::serve(listener, pool.clone()));

    shutdown.await;
    accept_task.abort();
    pool.shutdown();
    tracing::info!("proxy stopped");
    Ok(())
}
