//! Listener loop: accept redirected connections and run each through
//! correlation, dialer selection, dialing and relay on its own task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::LocalConfig;
use crate::correlator::Correlator;
use crate::dialer::Dialer;
use crate::error::{ConnError, DialError, StartupError};
use crate::mode::SelectMode;
use crate::registry::Registry;
use crate::relay::relay;
use crate::selector::ProxySelector;
use crate::stats::ProxyStats;

/// The running redirection endpoint. Immutable once built.
pub struct ProxyNode {
    listen_addr: SocketAddr,
    selector: ProxySelector,
    correlator: Correlator,
    connect_timeout: Option<Duration>,
    limiter: Option<Arc<Semaphore>>,
    stats: ProxyStats,
}

impl ProxyNode {
    pub fn new(listen_addr: SocketAddr, selector: ProxySelector, correlator: Correlator) -> Self {
        Self {
            listen_addr,
            selector,
            correlator,
            connect_timeout: None,
            limiter: None,
            stats: ProxyStats::new(),
        }
    }

    /// Resolve addresses and build the node. Errors here are fatal.
    pub async fn from_config(
        config: &LocalConfig,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, StartupError> {
        let listen = &config.server.listen_address;
        let listen_addr = tokio::net::lookup_host(listen.as_str())
            .await
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses")
                })
            })
            .map_err(|source| StartupError::ListenAddress {
                addr: listen.clone(),
                source,
            })?;

        let selector = ProxySelector::from_config(&config.proxy).await?;

        let mut node = Self::new(listen_addr, selector, Correlator::new(registry));
        node.connect_timeout = config.proxy.connect_timeout_ms.map(Duration::from_millis);
        node.limiter = config
            .server
            .max_connections
            // Zero permits would park every session forever; treat it as unbounded.
            .filter(|&n| n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));
        Ok(node)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Run one accepted connection to completion and log how it ended.
    async fn handle_conn(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        let session_id = Uuid::new_v4();
        let span = graftcp_tracing::connection_span!(session_id, peer);

        async {
            // Waiting here, not in the accept loop, keeps accepting live.
            let _permit = match &self.limiter {
                Some(limiter) => limiter.clone().acquire_owned().await.ok(),
                None => None,
            };

            match self.serve_conn(conn, peer).await {
                Ok(()) => {}
                Err(e @ ConnError::NoDialer { .. }) => {
                    tracing::error!(error = %e, "Connection dropped");
                }
                Err(e) => tracing::warn!(error = %e, "Connection dropped"),
            }
        }
        .instrument(span)
        .await
    }

    async fn serve_conn(&self, conn: TcpStream, peer: SocketAddr) -> Result<(), ConnError> {
        let local = conn.local_addr().map_err(ConnError::Endpoints)?;
        let is_ipv6 = local.is_ipv6();

        // On the traced process's socket our peer is the local end.
        let Some(found) = self.correlator.correlate(peer, local, is_ipv6).await else {
            self.stats.inc_correlation_failures();
            return Err(ConnError::Correlation { peer });
        };
        self.stats.inc_correlated();

        let span = tracing::Span::current();
        span.record("pid", found.pid.as_str());
        span.record("dest_addr", found.dest_addr.as_str());
        tracing::info!(
            pid = %found.pid,
            source_addr = %peer,
            dest_addr = %found.dest_addr,
            "Request"
        );

        let (upstream, dialer) = self.connect_upstream(&found.dest_addr).await?;
        span.record("dialer", dialer.as_str());

        let outcome = relay(conn, upstream).await;
        let up = outcome.client_to_upstream.bytes;
        let down = outcome.upstream_to_client.bytes;
        span.record("bytes_up", up);
        span.record("bytes_down", down);
        self.stats.record_relay(up, down);

        tracing::info!(
            bytes_up = up,
            bytes_down = down,
            up_error = ?outcome.client_to_upstream.error.as_ref().map(ToString::to_string),
            down_error = ?outcome.upstream_to_client.error.as_ref().map(ToString::to_string),
            "Relay finished"
        );
        Ok(())
    }

    /// Dial `dest` through the selected dialer. In `auto` mode a failed
    /// proxied dial gets exactly one direct retry.
    ///
    /// Returns the stream and the name of the dialer that produced it.
    pub async fn connect_upstream(&self, dest: &str) -> Result<(TcpStream, String), ConnError> {
        let mode = self.selector.mode();
        let dialer = self.selector.select().ok_or(ConnError::NoDialer { mode })?;

        let first = match self.dial(dialer, dest).await {
            Ok(stream) => return Ok((stream, dialer.to_string())),
            Err(e) => e,
        };

        if mode != SelectMode::Auto || dialer.is_direct() {
            self.stats.inc_dial_failures();
            return Err(ConnError::Dial {
                dest: dest.to_string(),
                source: first,
            });
        }

        tracing::info!(
            error = %first,
            dialer = %dialer,
            dest_addr = %dest,
            "Proxy dial failed, dialing direct"
        );
        self.stats.inc_direct_fallbacks();
        let direct = self.selector.direct();
        match self.dial(direct, dest).await {
            Ok(stream) => Ok((stream, direct.to_string())),
            Err(source) => {
                self.stats.inc_dial_failures();
                Err(ConnError::Dial {
                    dest: dest.to_string(),
                    source,
                })
            }
        }
    }

    async fn dial(&self, dialer: &Dialer, dest: &str) -> Result<TcpStream, DialError> {
        let span = graftcp_tracing::dial_span!(dialer, dest);
        let start = Instant::now();

        async {
            let result = match self.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, dialer.dial(dest))
                    .await
                    .unwrap_or_else(|_| Err(DialError::Timeout(limit.as_millis() as u64))),
                None => dialer.dial(dest).await,
            };
            tracing::Span::current().record("latency_ms", start.elapsed().as_millis() as u64);
            result
        }
        .instrument(span)
        .await
    }
}

/// Bind the configured address and accept until Ctrl-C.
pub async fn run(node: Arc<ProxyNode>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(node.listen_addr()).await?;
    tracing::info!(address = %node.listen_addr(), "graftcp-local listening");

    serve(listener, node.clone(), shutdown_signal()).await;

    tracing::info!(stats = ?node.stats().snapshot(), "graftcp-local stopped accepting");
    Ok(())
}

/// Accept on `listener` until `shutdown` resolves. Every connection runs on
/// its own task; in-flight sessions are not drained.
pub async fn serve<F>(listener: TcpListener, node: Arc<ProxyNode>, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    node.stats.inc_accepted();
                    tokio::spawn(node.clone().handle_conn(conn, peer));
                }
                Err(e) => tracing::error!(error = %e, "Accept failed"),
            },
        }
    }
}

/// Wait for SIGINT (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Address nothing listens on.
    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut s, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn test_node(mode: SelectMode, socks5: Option<Dialer>, registry: Arc<FakeRegistry>) -> ProxyNode {
        ProxyNode::new(
            "127.0.0.1:0".parse().unwrap(),
            ProxySelector::new(mode, socks5, None),
            Correlator::new(registry),
        )
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_auto_mode_falls_back_to_direct_once() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = target.local_addr().unwrap().to_string();
        let socks5 = Dialer::Socks5 {
            proxy: dead_addr().await,
            credentials: None,
        };
        let node = test_node(SelectMode::Auto, Some(socks5), Arc::new(FakeRegistry::new(None)));

        let (_stream, dialer) = node.connect_upstream(&dest).await.unwrap();
        assert_eq!(dialer, "direct");

        tokio::time::timeout(Duration::from_secs(1), target.accept())
            .await
            .expect("direct dial should reach the target")
            .unwrap();
        let stats = node.stats().snapshot();
        assert_eq!(stats.direct_fallbacks, 1);
        assert_eq!(stats.dial_failures, 0);
    }

    #[tokio::test]
    async fn test_only_socks5_does_not_fall_back() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = target.local_addr().unwrap().to_string();
        let socks5 = Dialer::Socks5 {
            proxy: dead_addr().await,
            credentials: None,
        };
        let node = test_node(SelectMode::OnlySocks5, Some(socks5), Arc::new(FakeRegistry::new(None)));

        assert!(matches!(
            node.connect_upstream(&dest).await,
            Err(ConnError::Dial { .. })
        ));
        assert!(
            tokio::time::timeout(Duration::from_millis(200), target.accept())
                .await
                .is_err(),
            "no direct dial may reach the target"
        );
        let stats = node.stats().snapshot();
        assert_eq!(stats.direct_fallbacks, 0);
        assert_eq!(stats.dial_failures, 1);
    }

    #[tokio::test]
    async fn test_unconfigured_mode_reports_no_dialer() {
        let node = test_node(SelectMode::OnlyHttpProxy, None, Arc::new(FakeRegistry::new(None)));
        assert!(matches!(
            node.connect_upstream("127.0.0.1:9").await,
            Err(ConnError::NoDialer {
                mode: SelectMode::OnlyHttpProxy
            })
        ));
    }

    #[tokio::test]
    async fn test_zero_max_connections_is_unbounded() {
        let mut config = LocalConfig::default();
        config.server.max_connections = Some(0);
        let registry: Arc<dyn Registry> = Arc::new(FakeRegistry::new(None));
        let node = ProxyNode::from_config(&config, registry.clone()).await.unwrap();
        assert!(node.limiter.is_none());

        config.server.max_connections = Some(8);
        let node = ProxyNode::from_config(&config, registry).await.unwrap();
        assert_eq!(node.limiter.map(|l| l.available_permits()), Some(8));
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        // Non-routable address: the connect hangs until the timeout fires.
        let mut node = test_node(SelectMode::Direct, None, Arc::new(FakeRegistry::new(None)));
        node.connect_timeout = Some(Duration::from_millis(50));
        match node.connect_upstream("10.255.255.1:81").await {
            Err(ConnError::Dial { source, .. }) => {
                assert!(matches!(source, DialError::Timeout(50) | DialError::Io(_)))
            }
            other => panic!("expected dial failure, got {:?}", other.map(|(_, d)| d)),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_correlated_relay() {
        let echo = echo_server().await;
        let registry = Arc::new(FakeRegistry::new(Some(77)));
        registry.own("4321", 77);
        registry.insert("4321".to_string(), echo.to_string());

        let node = Arc::new(test_node(SelectMode::Direct, None, registry.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, node.clone(), std::future::pending()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("echo should come back through the relay")
            .unwrap();
        assert_eq!(&buf, b"hello");
        assert!(registry.table.get("4321").is_none());

        drop(client);
        wait_for(|| node.stats().snapshot().relays_completed == 1).await;
        let stats = node.stats().snapshot();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.correlated, 1);
        assert_eq!(stats.bytes_up, 5);
    }

    #[tokio::test]
    async fn test_uncorrelated_connection_is_closed() {
        let registry = Arc::new(FakeRegistry::new(None));
        let node = Arc::new(test_node(SelectMode::Direct, None, registry));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, node.clone(), std::future::pending()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .expect("connection should be closed")
            .unwrap();
        assert_eq!(n, 0);
        wait_for(|| node.stats().snapshot().correlation_failures == 1).await;
    }
}
