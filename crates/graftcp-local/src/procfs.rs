//! Linux procfs socket inspection.
//!
//! `/proc/net/tcp{,6}` rows map an endpoint pair to a socket inode, and
//! `/proc/<pid>/fd/*` links of the form `socket:[<inode>]` map the inode
//! back to the processes holding it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::RegistryError;

/// Handle on a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::at("/proc")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TcpEntry {
    local: SocketAddr,
    remote: SocketAddr,
    inode: u64,
}

impl ProcFs {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Inode of the TCP socket whose endpoints are exactly `local -> remote`.
    pub fn socket_inode(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        is_ipv6: bool,
    ) -> Result<u64, RegistryError> {
        let table = if is_ipv6 { "net/tcp6" } else { "net/tcp" };
        let contents = std::fs::read_to_string(self.root.join(table))?;

        contents
            .lines()
            .skip(1)
            .filter_map(|line| parse_tcp_entry(line, is_ipv6))
            .find(|entry| {
                entry.inode != 0
                    && same_endpoint(entry.local, local)
                    && same_endpoint(entry.remote, remote)
            })
            .map(|entry| entry.inode)
            .ok_or(RegistryError::InodeNotFound { local, remote })
    }

    /// Whether any fd of `pid` references socket `inode`.
    pub fn pid_has_socket(&self, pid: &str, inode: u64) -> bool {
        let Ok(fds) = std::fs::read_dir(self.root.join(pid).join("fd")) else {
            return false;
        };

        fds.filter_map(Result::ok)
            .filter_map(|fd| std::fs::read_link(fd.path()).ok())
            .any(|target| parse_socket_inode(&target.to_string_lossy()) == Some(inode))
    }
}

/// The kernel tables carry no scope id or flow label, so only the address
/// and port take part in the match.
fn same_endpoint(table: SocketAddr, accepted: SocketAddr) -> bool {
    table.ip() == accepted.ip() && table.port() == accepted.port()
}

fn parse_tcp_entry(line: &str, is_ipv6: bool) -> Option<TcpEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    Some(TcpEntry {
        local: parse_endpoint(fields[1], is_ipv6)?,
        remote: parse_endpoint(fields[2], is_ipv6)?,
        inode: fields[9].parse().ok()?,
    })
}

fn parse_endpoint(value: &str, is_ipv6: bool) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = value.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = if is_ipv6 {
        parse_ipv6(addr_hex)?
    } else {
        parse_ipv4(addr_hex)?
    };
    Some(SocketAddr::new(ip, port))
}

/// The kernel prints the address as one host-order (little-endian) word.
fn parse_ipv4(hex: &str) -> Option<IpAddr> {
    if hex.len() != 8 {
        return None;
    }
    let word = u32::from_str_radix(hex, 16).ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(word.to_le_bytes())))
}

/// Four host-order words, most significant first.
fn parse_ipv6(hex: &str) -> Option<IpAddr> {
    if hex.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
        let word = u32::from_str_radix(&hex[i * 8..(i + 1) * 8], 16).ok()?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}

fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}
