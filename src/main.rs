use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use devgate::config;
use devgate::proxy::Proxy;
use devgate::supervisor::Supervisor;
use devgate::watcher::FileWatcher;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = parse_config_flag().context("usage: devgate -c <config>")?;
    let config = config::load(Path::new(&config_path))?;
    info!(path = %config_path, "configuration loaded");

    let watcher = Arc::new(FileWatcher::new()?);

    let mut servers = HashMap::new();
    let mut default_server = None;
    for host_config in &config.servers {
        let srv = Supervisor::new(host_config, Arc::clone(&watcher), config.port)
            .with_context(|| format!("invalid server entry {:?}", host_config.host))?;
        info!(host = %host_config.host, port = host_config.port, "registered host");
        if default_server.is_none() || host_config.default {
            default_server = Some(Arc::clone(&srv));
        }
        servers.insert(host_config.host.clone(), srv);
    }
    let servers = Arc::new(servers);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy = Proxy::new(config.port, Arc::clone(&servers), default_server);
    let mut proxy_handle = tokio::spawn(proxy.run(shutdown_rx));

    let failure = wait_for_shutdown(&mut proxy_handle).await;

    let _ = shutdown_tx.send(true);
    for srv in servers.values() {
        srv.shutdown().await;
    }
    watcher.close();

    match failure {
        Some(result) => {
            result.context("proxy task failed")??;
            anyhow::bail!("proxy exited unexpectedly");
        }
        None => {
            let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Block until a shutdown signal arrives or the proxy task ends on its
/// own (bind failure); the latter is returned to the caller.
async fn wait_for_shutdown(
    proxy_handle: &mut tokio::task::JoinHandle<anyhow::Result<()>>,
) -> Option<Result<anyhow::Result<()>, tokio::task::JoinError>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                None
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                None
            }
            result = proxy_handle => Some(result),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
                None
            }
            result = proxy_handle => Some(result),
        }
    }
}

/// The single `-c <path>` flag naming the configuration file.
fn parse_config_flag() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("-c=") {
            return Some(path.to_string());
        }
    }
    None
}
