//! Flin - unified data-plane server
//!
//! Main entry point: reads configuration from the environment (or a JSON
//! config file), starts the TCP listener, and shuts down gracefully on
//! SIGINT/SIGTERM.
//!
//! Environment variables:
//! - `FLIN_CONFIG`: path to a JSON config file (other variables override it)
//! - `FLIN_NODE_ID`: node identifier (default `node-1`)
//! - `FLIN_HOST` / `FLIN_PORT`: listen address (default `0.0.0.0:7380`)
//! - `FLIN_DATA_DIR`: on-disk data root; unset or empty means in-memory
//! - `FLIN_WORKERS`: worker pool size (default 256)
//! - `FLIN_SHARDS`: shard count in [1, 256] (default 64)

use anyhow::Context;
use flin::{Server, ServerConfig};

fn env_config() -> anyhow::Result<ServerConfig> {
    let mut config = match std::env::var("FLIN_CONFIG") {
        Ok(path) if !path.is_empty() => ServerConfig::from_file(&path)
            .with_context(|| format!("loading config file {path}"))?,
        _ => ServerConfig::default(),
    };

    if let Ok(node_id) = std::env::var("FLIN_NODE_ID") {
        config = config.with_node_id(node_id);
    }
    if let Ok(host) = std::env::var("FLIN_HOST") {
        config = config.with_host(host);
    }
    if let Ok(port) = std::env::var("FLIN_PORT") {
        config = config.with_port(port.parse().context("parsing FLIN_PORT")?);
    }
    if let Ok(dir) = std::env::var("FLIN_DATA_DIR") {
        config = config.with_data_dir(dir);
    }
    if let Ok(workers) = std::env::var("FLIN_WORKERS") {
        config = config.with_workers(workers.parse().context("parsing FLIN_WORKERS")?);
    }
    if let Ok(shards) = std::env::var("FLIN_SHARDS") {
        config = config.with_shards(shards.parse().context("parsing FLIN_SHARDS")?);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("Flin data-plane server v{}", flin::VERSION);

    let config = env_config()?;
    let server = Server::bind(config).await.context("starting server")?;
    let handle = server.shutdown_handle();

    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => Some(sigterm),
                Err(err) => {
                    log::error!("failed to install SIGTERM handler: {err}");
                    None
                }
            };
        match sigterm.as_mut() {
            Some(sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
                    _ = sigterm.recv() => log::info!("received SIGTERM"),
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
                log::info!("received SIGINT");
            }
        }
        handle.shutdown();
    });

    server.serve().await.context("serving")?;
    Ok(())
}
