//! In-memory registry double for unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::RegistryError;
use crate::registry::{PidAddrTable, Registry};

/// Registry whose kernel side is scripted: every lookup resolves to the same
/// inode (or fails), and pid ownership is declared up front.
pub struct FakeRegistry {
    pub table: PidAddrTable,
    inode: Option<u64>,
    owners: Mutex<HashMap<String, u64>>,
    lookups: AtomicUsize,
    delayed: Mutex<Option<(usize, String, String)>>,
}

impl FakeRegistry {
    pub fn new(inode: Option<u64>) -> Self {
        Self {
            table: PidAddrTable::new(),
            inode,
            owners: Mutex::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
            delayed: Mutex::new(None),
        }
    }

    pub fn own(&self, pid: &str, inode: u64) {
        self.owners.lock().unwrap().insert(pid.to_string(), inode);
    }

    /// Register `pid -> addr` only when the `n`th inode lookup happens,
    /// standing in for a notification that arrives after the connection.
    pub fn insert_on_lookup(&self, n: usize, pid: &str, addr: &str) {
        *self.delayed.lock().unwrap() = Some((n, pid.to_string(), addr.to_string()));
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Registry for FakeRegistry {
    fn lookup_inode(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        _is_ipv6: bool,
    ) -> Result<u64, RegistryError> {
        let n = self.lookups.fetch_add(1, Ordering::SeqCst) + 1;
        let mut delayed = self.delayed.lock().unwrap();
        if delayed.as_ref().is_some_and(|(at, _, _)| *at == n) {
            if let Some((_, pid, addr)) = delayed.take() {
                self.table.insert(pid, addr);
            }
        }
        self.inode
            .ok_or(RegistryError::InodeNotFound { local, remote })
    }

    fn for_each_pid_addr(&self, visit: &mut dyn FnMut(&str, &str) -> bool) {
        self.table.for_each(visit);
    }

    fn pid_owns_inode(&self, pid: &str, inode: u64) -> bool {
        self.owners.lock().unwrap().get(pid) == Some(&inode)
    }

    fn remove(&self, pid: &str) {
        self.table.remove(pid);
    }

    fn insert(&self, pid: String, addr: String) {
        self.table.insert(pid, addr);
    }
}
