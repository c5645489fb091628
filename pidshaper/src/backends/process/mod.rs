// Process utilities trait for platform-specific operations
//
// This module provides a platform-agnostic interface for the process-related
// operations the shaper needs: the socket table for packet attribution and the
// process tree for toggling a whole process group.

use anyhow::Result;
use std::collections::HashMap;
use std::net::IpAddr;

/// Platform-agnostic process utilities interface
pub trait ProcessUtils: Send + Sync {
    /// Get process name by PID
    fn get_process_name(&self, pid: i32) -> Result<String>;

    /// Check if process exists
    fn process_exists(&self, pid: i32) -> bool;

    /// Get all running processes with their names and parents
    fn get_all_processes(&self) -> Result<Vec<ProcessEntry>>;

    /// Get socket-to-PID mapping for network connections
    fn get_connection_map(&self) -> Result<ConnectionMap>;

    /// Name of the socket mapper backend in use
    fn socket_mapper_name(&self) -> &str;
}

/// Process entry with PID, parent and name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: i32,
    pub parent_pid: Option<i32>,
    pub name: String,
}

/// Complete connection map including socket inodes and connections
#[derive(Debug, Clone, Default)]
pub struct ConnectionMap {
    /// Socket inode -> (PID, process name) mapping
    pub socket_to_pid: HashMap<u64, (i32, String)>,
    /// TCP IPv4 connections
    pub tcp_connections: Vec<ConnectionEntry>,
    /// TCP IPv6 connections
    pub tcp6_connections: Vec<ConnectionEntry>,
    /// UDP IPv4 connections
    pub udp_connections: Vec<ConnectionEntry>,
    /// UDP IPv6 connections
    pub udp6_connections: Vec<ConnectionEntry>,
}

impl ConnectionMap {
    /// All connections in enumeration order: TCP, TCP6, UDP, UDP6
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.tcp_connections
            .iter()
            .chain(self.tcp6_connections.iter())
            .chain(self.udp_connections.iter())
            .chain(self.udp6_connections.iter())
    }

    /// Owning PID of a connection, if its socket still belongs to a process
    pub fn owner(&self, entry: &ConnectionEntry) -> Option<i32> {
        self.socket_to_pid.get(&entry.inode).map(|(pid, _)| *pid)
    }

    pub fn len(&self) -> usize {
        self.tcp_connections.len()
            + self.tcp6_connections.len()
            + self.udp_connections.len()
            + self.udp6_connections.len()
    }
}

/// Network connection entry
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub inode: u64,
}

impl ConnectionEntry {
    /// Listening and unconnected UDP sockets carry no remote endpoint
    pub fn has_remote(&self) -> bool {
        self.remote_port != 0 && !self.remote_addr.is_unspecified()
    }
}

// Socket mapper backend system (cross-platform)
pub mod socket_mapper;

// Platform-specific implementations
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxProcessUtils;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::WindowsProcessUtils;

/// Factory function to create platform-specific ProcessUtils with custom socket mapper
pub fn create_process_utils_with_socket_mapper(
    socket_mapper_preference: Option<&str>,
) -> Result<Box<dyn ProcessUtils>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(LinuxProcessUtils::with_socket_mapper(
            socket_mapper_preference,
        )?))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(WindowsProcessUtils::with_socket_mapper(
            socket_mapper_preference,
        )?))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        compile_error!("Unsupported platform - only Linux and Windows are currently supported");
    }
}
