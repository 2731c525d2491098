//! PID → destination registry.
//!
//! The notification pipe records which process is about to connect where;
//! the correlator joins those records against kernel socket state to find
//! the owner of an accepted connection. [`Registry`] is the seam between
//! the two, and [`ProcRegistry`] backs it with an in-memory table plus
//! Linux procfs inspection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::error::RegistryError;
use crate::procfs::ProcFs;

/// Shared PID/address store consulted by every connection task.
///
/// Implementations are internally synchronized; callers never lock.
pub trait Registry: Send + Sync {
    /// Socket inode backing the TCP connection `local -> remote`.
    fn lookup_inode(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        is_ipv6: bool,
    ) -> Result<u64, RegistryError>;

    /// Visit registered `(pid, addr)` pairs until `visit` returns false.
    fn for_each_pid_addr(&self, visit: &mut dyn FnMut(&str, &str) -> bool);

    /// Whether `pid` holds a file descriptor referencing socket `inode`.
    fn pid_owns_inode(&self, pid: &str, inode: u64) -> bool;

    fn remove(&self, pid: &str);

    /// Record `addr` as the pending destination of `pid`, replacing any
    /// earlier unmatched entry.
    fn insert(&self, pid: String, addr: String);
}

/// Mutex-guarded PID → destination table.
#[derive(Default)]
pub struct PidAddrTable {
    entries: Mutex<HashMap<String, String>>,
}

impl PidAddrTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, pid: String, addr: String) {
        self.lock().insert(pid, addr);
    }

    pub fn remove(&self, pid: &str) -> Option<String> {
        self.lock().remove(pid)
    }

    #[cfg(test)]
    pub fn get(&self, pid: &str) -> Option<String> {
        self.lock().get(pid).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Visits a snapshot so the visitor may do slow work (procfs reads)
    /// without holding the lock.
    pub fn for_each(&self, visit: &mut dyn FnMut(&str, &str) -> bool) {
        let snapshot: Vec<(String, String)> = self
            .lock()
            .iter()
            .map(|(p, a)| (p.clone(), a.clone()))
            .collect();
        for (pid, addr) in &snapshot {
            if !visit(pid, addr) {
                break;
            }
        }
    }
}

/// Registry backed by `/proc` socket tables and per-process fd listings.
pub struct ProcRegistry {
    table: PidAddrTable,
    procfs: ProcFs,
}

impl ProcRegistry {
    pub fn new() -> Self {
        Self::with_procfs(ProcFs::default())
    }

    pub fn with_procfs(procfs: ProcFs) -> Self {
        Self {
            table: PidAddrTable::new(),
            procfs,
        }
    }

    pub fn pending(&self) -> usize {
        self.table.len()
    }
}

impl Default for ProcRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry for ProcRegistry {
    fn lookup_inode(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        is_ipv6: bool,
    ) -> Result<u64, RegistryError> {
        self.procfs.socket_inode(local, remote, is_ipv6)
    }

    fn for_each_pid_addr(&self, visit: &mut dyn FnMut(&str, &str) -> bool) {
        self.table.for_each(visit);
    }

    fn pid_owns_inode(&self, pid: &str, inode: u64) -> bool {
        self.procfs.pid_has_socket(pid, inode)
    }

    fn remove(&self, pid: &str) {
        self.table.remove(pid);
    }

    fn insert(&self, pid: String, addr: String) {
        tracing::debug!(pid = %pid, dest_addr = %addr, "Registered pending connection");
        self.table.insert(pid, addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_last_write_wins() {
        let table = PidAddrTable::new();
        table.insert("100".to_string(), "1.1.1.1:80".to_string());
        table.insert("100".to_string(), "8.8.8.8:53".to_string());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("100").as_deref(), Some("8.8.8.8:53"));
    }

    #[test]
    fn test_for_each_stops_when_visitor_returns_false() {
        let table = PidAddrTable::new();
        for pid in ["1", "2", "3"] {
            table.insert(pid.to_string(), format!("10.0.0.{pid}:80"));
        }
        let mut visited = 0;
        table.for_each(&mut |_, _| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);

        let mut all = Vec::new();
        table.for_each(&mut |pid, _| {
            all.push(pid.to_string());
            true
        });
        all.sort();
        assert_eq!(all, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_visitor_may_mutate_table() {
        let table = PidAddrTable::new();
        table.insert("7".to_string(), "10.0.0.7:80".to_string());
        table.for_each(&mut |pid, _| {
            table.remove(pid);
            true
        });
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_proc_registry_remove() {
        let registry = ProcRegistry::new();
        registry.insert("42".to_string(), "[::1]:443".to_string());
        assert_eq!(registry.pending(), 1);
        registry.remove("42");
        assert_eq!(registry.pending(), 0);
    }
}
