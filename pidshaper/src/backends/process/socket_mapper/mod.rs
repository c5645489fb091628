//! Socket table readers: which process owns which local endpoint.
//!
//! Each platform has one native reader (procfs on Linux, the IP Helper owner-PID
//! tables on Windows). The table below is what `--list-backends` prints and what
//! `--socket-mapper` picks from.

use super::ConnectionMap;
use crate::backends::BackendPriority;
use anyhow::{Result, anyhow};

#[cfg(target_os = "linux")]
mod procfs;
#[cfg(target_os = "linux")]
pub use procfs::ProcfsSocketMapper;

#[cfg(target_os = "windows")]
mod iphelper;
#[cfg(target_os = "windows")]
pub use iphelper::IpHelperSocketMapper;

pub trait SocketMapper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read the current socket table.
    ///
    /// Runs on the packet path, once per packet when the resolver cache is off,
    /// so it must not block on anything but the OS query.
    fn read_table(&self) -> Result<ConnectionMap>;
}

#[derive(Debug, Clone)]
pub struct SocketMapperInfo {
    pub name: &'static str,
    pub priority: BackendPriority,
    pub available: bool,
}

struct Candidate {
    name: &'static str,
    priority: BackendPriority,
    available: fn() -> bool,
    open: fn() -> Result<Box<dyn SocketMapper>>,
}

#[cfg(target_os = "linux")]
fn open_procfs() -> Result<Box<dyn SocketMapper>> {
    Ok(Box::new(ProcfsSocketMapper::new()?))
}

#[cfg(target_os = "windows")]
fn open_iphelper() -> Result<Box<dyn SocketMapper>> {
    Ok(Box::new(IpHelperSocketMapper::new()?))
}

fn candidates() -> Vec<Candidate> {
    vec![
        #[cfg(target_os = "linux")]
        Candidate {
            name: "procfs",
            priority: BackendPriority::Best,
            available: ProcfsSocketMapper::is_available,
            open: open_procfs,
        },
        #[cfg(target_os = "windows")]
        Candidate {
            name: "iphelper",
            priority: BackendPriority::Best,
            available: IpHelperSocketMapper::is_available,
            open: open_iphelper,
        },
    ]
}

pub fn detect_socket_mappers() -> Vec<SocketMapperInfo> {
    candidates()
        .into_iter()
        .map(|c| SocketMapperInfo {
            name: c.name,
            priority: c.priority,
            available: (c.available)(),
        })
        .collect()
}

/// Open the named mapper, or the best available one when no name is given
pub fn select_socket_mapper(preference: Option<&str>) -> Result<Box<dyn SocketMapper>> {
    let all = candidates();

    let chosen = match preference {
        Some(name) => all
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| anyhow!("Unknown socket mapper: {}", name))?,
        None => all
            .iter()
            .filter(|c| (c.available)())
            .max_by_key(|c| c.priority)
            .ok_or_else(|| anyhow!("No socket mapper available on this system"))?,
    };

    (chosen.open)()
}
