//! Recover the originating process and intended destination of a
//! redirected connection.
//!
//! The redirect rewrote the connection's destination to our listener, so the
//! only link back is the kernel socket: find its inode, then find the
//! registered pid holding that inode. The pipe notification can lag the
//! connection itself, hence the short bounded retry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RegistryError;
use crate::registry::Registry;

/// Attempts per connection before giving up.
pub const CORRELATE_ATTEMPTS: usize = 3;

/// Pause between attempts.
pub const CORRELATE_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Owning pid and original destination of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub pid: String,
    pub dest_addr: String,
}

#[derive(Clone)]
pub struct Correlator {
    registry: Arc<dyn Registry>,
    attempts: usize,
    retry_interval: Duration,
}

impl Correlator {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            attempts: CORRELATE_ATTEMPTS,
            retry_interval: CORRELATE_RETRY_INTERVAL,
        }
    }

    /// Resolve the connection `local -> remote`, as seen from the traced
    /// process's side of the socket.
    ///
    /// `None` means either the socket is gone from the kernel tables (returned
    /// immediately) or no registered pid owns it after every attempt. On a
    /// match the pid's registry entry is consumed.
    pub async fn correlate(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        is_ipv6: bool,
    ) -> Option<Correlation> {
        for attempt in 1..=self.attempts {
            let registry = self.registry.clone();
            let scan =
                tokio::task::spawn_blocking(move || find_owner(&*registry, local, remote, is_ipv6))
                    .await;

            match scan {
                Ok(Ok(Some(found))) => {
                    self.registry.remove(&found.pid);
                    tracing::debug!(
                        pid = %found.pid,
                        dest_addr = %found.dest_addr,
                        attempt,
                        "Correlated connection"
                    );
                    return Some(found);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, %local, %remote, "Socket inode lookup failed");
                    return None;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Registry scan task failed");
                    return None;
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.retry_interval).await;
            }
        }

        None
    }
}

/// One lookup-and-scan pass.
fn find_owner(
    registry: &dyn Registry,
    local: SocketAddr,
    remote: SocketAddr,
    is_ipv6: bool,
) -> Result<Option<Correlation>, RegistryError> {
    let inode = registry.lookup_inode(local, remote, is_ipv6)?;

    let mut found = None;
    registry.for_each_pid_addr(&mut |pid, addr| {
        if registry.pid_owns_inode(pid, inode) {
            found = Some(Correlation {
                pid: pid.to_string(),
                dest_addr: addr.to_string(),
            });
            return false;
        }
        true
    });
    Ok(found)
}
