//! Proxy selection mode.

use std::fmt;

/// Policy deciding which upstream dialer serves a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// SOCKS5 if configured, else HTTP proxy, else direct. Falls back to a
    /// direct dial when the proxied dial fails.
    Auto,
    /// Uniform pick between SOCKS5 and HTTP proxy per connection.
    Random,
    OnlySocks5,
    OnlyHttpProxy,
    Direct,
}

impl SelectMode {
    /// Parse a configured mode string.
    ///
    /// Returns `None` for unrecognized values; callers decide the fallback.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(SelectMode::Auto),
            "random" => Some(SelectMode::Random),
            "only_socks5" => Some(SelectMode::OnlySocks5),
            "only_http_proxy" => Some(SelectMode::OnlyHttpProxy),
            "direct" => Some(SelectMode::Direct),
            _ => None,
        }
    }

    /// Parse a configured mode string, treating anything unrecognized as
    /// `only_socks5`.
    pub fn from_config(s: &str) -> Self {
        Self::parse(s).unwrap_or_else(|| {
            tracing::warn!(
                select_mode = %s,
                "Unrecognized proxy select mode, using only_socks5"
            );
            SelectMode::OnlySocks5
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectMode::Auto => "auto",
            SelectMode::Random => "random",
            SelectMode::OnlySocks5 => "only_socks5",
            SelectMode::OnlyHttpProxy => "only_http_proxy",
            SelectMode::Direct => "direct",
        }
    }
}

impl fmt::Display for SelectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
