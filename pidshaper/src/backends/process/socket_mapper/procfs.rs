use super::SocketMapper;
use crate::backends::process::{ConnectionEntry, ConnectionMap};
use anyhow::Result;
use procfs::process::{FDTarget, all_processes};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Socket mapper using Linux /proc filesystem
///
/// This backend reads socket information from:
/// - /proc/[pid]/fd/ - for socket inodes
/// - /proc/net/tcp - for TCP IPv4 connections
/// - /proc/net/tcp6 - for TCP IPv6 connections
/// - /proc/net/udp - for UDP IPv4 connections
/// - /proc/net/udp6 - for UDP IPv6 connections
pub struct ProcfsSocketMapper;

impl ProcfsSocketMapper {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("procfs not available (is /proc mounted?)");
        }
        Ok(Self)
    }

    pub fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }
}

fn to_entries(rows: impl Iterator<Item = (SocketAddr, SocketAddr, u64)>) -> Vec<ConnectionEntry> {
    rows.map(|(local, remote, inode)| ConnectionEntry {
        local_addr: local.ip(),
        local_port: local.port(),
        remote_addr: remote.ip(),
        remote_port: remote.port(),
        inode,
    })
    .collect()
}

impl SocketMapper for ProcfsSocketMapper {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn read_table(&self) -> Result<ConnectionMap> {
        let mut socket_to_pid = HashMap::new();

        // Build socket inode -> PID map by scanning all processes. Without root,
        // other users' fd tables are unreadable and their sockets stay unowned.
        for process in all_processes()?.flatten() {
            let pid = process.pid();
            let Ok(fds) = process.fd() else {
                continue;
            };
            let name = process
                .stat()
                .map(|stat| stat.comm)
                .unwrap_or_else(|_| format!("PID {}", pid));

            for fd_info in fds.flatten() {
                if let FDTarget::Socket(inode) = fd_info.target {
                    socket_to_pid.insert(inode, (pid, name.clone()));
                }
            }
        }

        // A missing table (e.g. IPv6 disabled) just contributes nothing
        let tcp_connections = procfs::net::tcp()
            .map(|rows| {
                to_entries(
                    rows.into_iter()
                        .map(|e| (e.local_address, e.remote_address, e.inode)),
                )
            })
            .unwrap_or_default();
        let tcp6_connections = procfs::net::tcp6()
            .map(|rows| {
                to_entries(
                    rows.into_iter()
                        .map(|e| (e.local_address, e.remote_address, e.inode)),
                )
            })
            .unwrap_or_default();
        let udp_connections = procfs::net::udp()
            .map(|rows| {
                to_entries(
                    rows.into_iter()
                        .map(|e| (e.local_address, e.remote_address, e.inode)),
                )
            })
            .unwrap_or_default();
        let udp6_connections = procfs::net::udp6()
            .map(|rows| {
                to_entries(
                    rows.into_iter()
                        .map(|e| (e.local_address, e.remote_address, e.inode)),
                )
            })
            .unwrap_or_default();

        Ok(ConnectionMap {
            socket_to_pid,
            tcp_connections,
            tcp6_connections,
            udp_connections,
            udp6_connections,
        })
    }
}
