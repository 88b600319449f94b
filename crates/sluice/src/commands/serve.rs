use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sluice_proxy::{ProxyConfig, ProxyServer};
use sluice_settings::{ConfigLoader, SluiceConfig};
use tracing::info;

use crate::cli::ServeArgs;
use crate::error::CliError;

pub async fn serve(args: ServeArgs, cwd: PathBuf) -> Result<(), CliError> {
    let settings = effective_settings(&args, &cwd)?;
    let config = proxy_config(&args, &settings).await?;

    let handle = ProxyServer::new(config)?.start().await?;
    // Scripts and tests read the bound address from this line.
    println!("Listening on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    handle.shutdown().await?;
    Ok(())
}

fn effective_settings(args: &ServeArgs, cwd: &Path) -> Result<SluiceConfig, CliError> {
    let base = if args.no_config {
        SluiceConfig::default()
    } else {
        ConfigLoader::load(cwd)
    };
    match &args.extra_config {
        Some(path) => Ok(base.merge(SluiceConfig::load(path)?)),
        None => Ok(base),
    }
}

/// Command-line flags win over config files.
async fn proxy_config(args: &ServeArgs, settings: &SluiceConfig) -> Result<ProxyConfig, CliError> {
    let proxy = &settings.proxy;
    let host = args.host.as_deref().unwrap_or(proxy.host());
    let port = args.port.unwrap_or(proxy.port());

    let idle_timeout = match args.idle_timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => proxy.idle_timeout(),
    };

    Ok(ProxyConfig {
        bind_addr: resolve_bind_addr(host, port).await?,
        connect_timeout: args
            .connect_timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| proxy.connect_timeout()),
        idle_timeout,
        first_chunk_timeout: proxy.first_chunk_timeout(),
        max_connections: args.max_connections.unwrap_or(proxy.max_connections()),
    })
}

async fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr, CliError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| CliError::Other(format!("Cannot resolve listen host {host}: {e}")))?
        .next()
        .ok_or_else(|| CliError::Other(format!("Listen host {host} has no addresses")))
}
