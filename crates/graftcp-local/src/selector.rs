//! Upstream dialer selection policy.

use std::net::SocketAddr;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::UpstreamConfig;
use crate::dialer::{Credentials, Dialer};
use crate::error::StartupError;
use crate::mode::SelectMode;

/// Holds the configured dialers and answers which one serves the next
/// connection. Read-only after construction apart from the random source.
pub struct ProxySelector {
    mode: SelectMode,
    direct: Dialer,
    socks5: Option<Dialer>,
    http_proxy: Option<Dialer>,
    rng: Mutex<StdRng>,
}

impl ProxySelector {
    pub fn new(mode: SelectMode, socks5: Option<Dialer>, http_proxy: Option<Dialer>) -> Self {
        Self {
            mode,
            direct: Dialer::Direct,
            socks5,
            http_proxy,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the random source used by `random` mode.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Resolve the configured proxy addresses and build the selector.
    ///
    /// An address that does not resolve leaves its dialer unconfigured; it
    /// is fatal only when neither proxy resolves.
    pub async fn from_config(config: &UpstreamConfig) -> Result<Self, StartupError> {
        let socks5 = resolve(&config.socks5_address).await;
        let http = resolve(&config.http_proxy_address).await;

        let (socks5, http) = match (socks5, http) {
            (Err(socks5_error), Err(http_error)) => {
                return Err(StartupError::NoProxyResolvable {
                    socks5: config.socks5_address.clone(),
                    http: config.http_proxy_address.clone(),
                    socks5_error,
                    http_error,
                })
            }
            (socks5, http) => (socks5.ok(), http.ok()),
        };

        let credentials = config
            .socks5_username
            .as_ref()
            .filter(|user| !user.is_empty())
            .map(|user| Credentials {
                username: user.clone(),
                password: config.socks5_password.clone().unwrap_or_default(),
            });

        let selector = Self::new(
            SelectMode::from_config(&config.select_mode),
            socks5.map(|proxy| Dialer::Socks5 { proxy, credentials }),
            http.map(|proxy| Dialer::HttpConnect { proxy }),
        );

        tracing::info!(
            mode = %selector.mode,
            socks5 = ?selector.socks5.as_ref().map(ToString::to_string),
            http_proxy = ?selector.http_proxy.as_ref().map(ToString::to_string),
            "Proxy selector configured"
        );

        Ok(selector)
    }

    pub fn mode(&self) -> SelectMode {
        self.mode
    }

    pub fn direct(&self) -> &Dialer {
        &self.direct
    }

    /// Dialer for the next connection, or `None` when the active mode names
    /// a dialer that is not configured.
    pub fn select(&self) -> Option<&Dialer> {
        match self.mode {
            SelectMode::Auto => self
                .socks5
                .as_ref()
                .or(self.http_proxy.as_ref())
                .or(Some(&self.direct)),
            SelectMode::Random => match (&self.socks5, &self.http_proxy) {
                (Some(socks5), Some(http)) => {
                    let pick_socks5 = self
                        .rng
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .gen_bool(0.5);
                    Some(if pick_socks5 { socks5 } else { http })
                }
                (socks5, http) => socks5.as_ref().or(http.as_ref()),
            },
            SelectMode::OnlySocks5 => self.socks5.as_ref(),
            SelectMode::OnlyHttpProxy => self.http_proxy.as_ref(),
            SelectMode::Direct => Some(&self.direct),
        }
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, String> {
    if addr.is_empty() {
        return Err("not configured".to_string());
    }
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| e.to_string())?
        .next()
        .ok_or_else(|| "no addresses".to_string())
}
