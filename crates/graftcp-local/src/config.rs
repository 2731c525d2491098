//! Configuration types and loading logic.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use graftcp_tracing::TracingConfig;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: UpstreamConfig,
    #[serde(default)]
    pub fifo: FifoConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Upper bound on concurrently relayed sessions. Unset means unbounded.
    /// Permits are taken inside the session task, so accepting never stalls.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

/// Upstream proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_socks5_address")]
    pub socks5_address: String,

    #[serde(default)]
    pub socks5_username: Option<String>,

    #[serde(default)]
    pub socks5_password: Option<String>,

    /// Empty means no HTTP proxy.
    #[serde(default)]
    pub http_proxy_address: String,

    /// One of `auto`, `random`, `only_socks5`, `only_http_proxy`, `direct`.
    #[serde(default = "default_select_mode")]
    pub select_mode: String,

    /// Bound on a single dial attempt. Unset means no timeout.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

/// Notification pipe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FifoConfig {
    #[serde(default = "default_fifo_path")]
    pub path: String,

    /// Stop the whole process once the pipe closes instead of only logging it.
    #[serde(default)]
    pub exit_on_close: bool,
}

fn default_listen_address() -> String {
    "127.0.0.1:2233".to_string()
}

fn default_socks5_address() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_select_mode() -> String {
    "auto".to_string()
}

fn default_fifo_path() -> String {
    "/tmp/graftcplocal.fifo".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            max_connections: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            socks5_address: default_socks5_address(),
            socks5_username: None,
            socks5_password: None,
            http_proxy_address: String::new(),
            select_mode: default_select_mode(),
            connect_timeout_ms: None,
        }
    }
}

impl Default for FifoConfig {
    fn default() -> Self {
        Self {
            path: default_fifo_path(),
            exit_on_close: false,
        }
    }
}

impl LocalConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (GRAFTCP_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config: LocalConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("GRAFTCP_").split("__"))
            .extract()?;

        Ok(config)
    }
}
