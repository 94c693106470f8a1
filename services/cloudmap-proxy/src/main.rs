//! cloudmap-proxy
//!
//! TCP reverse proxy that forwards each accepted connection to a static
//! address or to an instance discovered through Cloud Map.
//!
//! This binary:
//! - Parses flags and environment into a [`Config`]
//! - Builds the cached discovery lookup
//! - Binds the listener and relays connections
//! - Turns SIGINT/SIGTERM into a single graceful shutdown

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cloudmap_proxy::config::{Args, Config, LogFormat};
use cloudmap_proxy::{parse_listen_addr, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_args(Args::parse())?;

    init_tracing(&config);

    info!(
        target_addr = %config.target,
        listen = %config.listen,
        connect_timeout_secs = config.connect_timeout.as_secs_f64(),
        cache_ttl_secs = config.cache_ttl.as_secs_f64(),
        discovery = ?config.discovery,
        "Configuration loaded"
    );

    let lookup = config.build_lookup().await?;
    let listen_addr = parse_listen_addr(&config.listen)
        .await
        .context("fail to resolve listen address")?;

    let mut server_config = ServerConfig::new(listen_addr);
    server_config.connect_timeout = config.connect_timeout;

    let server = Server::bind(server_config, config.target, lookup)
        .await
        .context("failed to start proxy")?;

    info!(
        bind_addr = %server.local_addr(),
        "cloudmap proxy started listening on {}",
        server.local_addr()
    );

    server.run_until(shutdown_signal()).await;
    info!("cloudmap proxy stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    // Prefer RUST_LOG, fall back to the configured debug level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received ctrl-c");
    Ok(())
}
