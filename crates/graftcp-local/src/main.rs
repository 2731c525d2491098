//! graftcp-local: accepts connections redirected away from traced processes,
//! recovers where each one was headed, and relays it there directly or
//! through a SOCKS5 / HTTP proxy.

mod config;
mod correlator;
mod dialer;
mod error;
mod fifo;
mod mode;
mod procfs;
mod registry;
mod relay;
mod selector;
mod server;
mod stats;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use clap::Parser;
use config::LocalConfig;
use registry::ProcRegistry;
use server::ProxyNode;

/// Relay connections redirected away from traced processes.
#[derive(Debug, Parser)]
#[command(name = "graftcp-local", version, about)]
struct Cli {
    /// TOML config file (also GRAFTCP_LOCAL_CONFIG)
    #[arg(long = "config", value_name = "PATH")]
    config: Option<String>,

    /// TOML config file, positional form of --config
    #[arg(value_name = "CONFIG", conflicts_with = "config")]
    config_file: Option<String>,

    /// Address to accept redirected connections on
    #[arg(long = "listen", value_name = "ADDR")]
    listen: Option<String>,

    /// SOCKS5 proxy address
    #[arg(long = "socks5", value_name = "ADDR")]
    socks5: Option<String>,

    #[arg(long = "socks5-username", value_name = "USER")]
    socks5_username: Option<String>,

    #[arg(long = "socks5-password", value_name = "PASS")]
    socks5_password: Option<String>,

    /// HTTP proxy address used with CONNECT
    #[arg(long = "http-proxy", value_name = "ADDR")]
    http_proxy: Option<String>,

    /// auto, random, only_socks5, only_http_proxy or direct
    #[arg(long = "select-proxy-mode", value_name = "MODE")]
    select_proxy_mode: Option<String>,

    /// Notification pipe path
    #[arg(long = "pipe-path", value_name = "PATH")]
    pipe_path: Option<String>,
}

impl Cli {
    /// CLI overrides take precedence over TOML and env vars
    fn apply(self, config: &mut LocalConfig) {
        if let Some(addr) = self.listen {
            config.server.listen_address = addr;
        }
        if let Some(addr) = self.socks5 {
            config.proxy.socks5_address = addr;
        }
        if self.socks5_username.is_some() {
            config.proxy.socks5_username = self.socks5_username;
        }
        if self.socks5_password.is_some() {
            config.proxy.socks5_password = self.socks5_password;
        }
        if let Some(addr) = self.http_proxy {
            config.proxy.http_proxy_address = addr;
        }
        if let Some(mode) = self.select_proxy_mode {
            config.proxy.select_mode = mode;
        }
        if let Some(path) = self.pipe_path {
            config.fifo.path = path;
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let mut cli = Cli::parse();

    // Determine config path
    let config_path = cli
        .config
        .take()
        .or_else(|| cli.config_file.take())
        .or_else(|| std::env::var("GRAFTCP_LOCAL_CONFIG").ok())
        .unwrap_or_else(|| "graftcp-local.toml".to_string());

    // Load configuration
    let mut config = LocalConfig::load(&config_path)?;
    cli.apply(&mut config);

    // The tonic OTLP exporter needs a reactor, so the runtime comes first
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize tracing; without an endpoint this is fmt-only
        let tracing_guard = graftcp_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            socks5 = %config.proxy.socks5_address,
            http_proxy = %config.proxy.http_proxy_address,
            select_mode = %config.proxy.select_mode,
            fifo = %config.fifo.path,
            otlp = tracing_guard.exporting(),
            "Starting graftcp-local"
        );

        run(config).await
    })
}

async fn run(config: LocalConfig) -> anyhow::Result<()> {
    // Resolve proxies and the listen address; failures here are fatal
    let registry = Arc::new(ProcRegistry::new());
    let node = Arc::new(ProxyNode::from_config(&config, registry.clone()).await?);

    // Start decoding notifications before accepting
    let decoder = tokio::spawn(fifo::run_from_path(
        config.fifo.path.clone(),
        registry.clone(),
    ));

    if config.fifo.exit_on_close {
        tokio::select! {
            served = server::run(node) => served?,
            _ = decoder => anyhow::bail!(
                "notification pipe {} closed, no further connections can be correlated",
                config.fifo.path
            ),
        }
    } else {
        server::run(node).await?;
    }

    tracing::info!(pending = registry.pending(), "Unmatched registrations at exit");
    Ok(())
}
