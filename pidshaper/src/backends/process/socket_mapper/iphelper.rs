// Windows IP Helper API-based socket mapper
//
// Uses GetExtendedTcpTable and GetExtendedUdpTable, which report the owning PID
// of every TCP and UDP endpoint (the same tables netstat -o reads).

use super::SocketMapper;
use crate::backends::process::{ConnectionEntry, ConnectionMap};
use anyhow::Result;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use sysinfo::{Pid, System};
use windows::Win32::Foundation::NO_ERROR;
use windows::Win32::NetworkManagement::IpHelper::{
    GetExtendedTcpTable, GetExtendedUdpTable, MIB_TCP6TABLE_OWNER_PID, MIB_TCPTABLE_OWNER_PID,
    MIB_UDP6TABLE_OWNER_PID, MIB_UDPTABLE_OWNER_PID, TCP_TABLE_OWNER_PID_ALL, UDP_TABLE_OWNER_PID,
};
use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};

/// Socket mapper using Windows IP Helper API
pub struct IpHelperSocketMapper;

impl IpHelperSocketMapper {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    /// Present on every supported Windows version
    pub fn is_available() -> bool {
        true
    }
}

/// One row of any of the four owner-PID tables
struct OwnedEndpoint {
    local_addr: IpAddr,
    local_port: u16,
    remote_addr: IpAddr,
    remote_port: u16,
    pid: i32,
}

impl SocketMapper for IpHelperSocketMapper {
    fn name(&self) -> &'static str {
        "iphelper"
    }

    fn read_table(&self) -> Result<ConnectionMap> {
        let mut map = ConnectionMap::default();
        let mut names: HashMap<i32, String> = HashMap::new();
        let sys = System::new_all();

        let tables = [
            (get_tcp_table(), &mut map.tcp_connections),
            (get_tcp6_table(), &mut map.tcp6_connections),
            (get_udp_table(), &mut map.udp_connections),
            (get_udp6_table(), &mut map.udp6_connections),
        ];

        for (table, out) in tables {
            let rows = match table {
                Ok(rows) => rows,
                Err(e) => {
                    log::debug!("Skipping connection table: {:#}", e);
                    continue;
                }
            };

            for row in rows {
                // Windows has no socket inodes, so each endpoint gets a synthetic one
                let inode = synthetic_inode(
                    &row.local_addr,
                    row.local_port,
                    &row.remote_addr,
                    row.remote_port,
                );
                let name = names
                    .entry(row.pid)
                    .or_insert_with(|| {
                        sys.process(Pid::from_u32(row.pid as u32))
                            .map(|p| p.name().to_string_lossy().to_string())
                            .unwrap_or_else(|| format!("PID {}", row.pid))
                    })
                    .clone();

                map.socket_to_pid.insert(inode, (row.pid, name));
                out.push(ConnectionEntry {
                    local_addr: row.local_addr,
                    local_port: row.local_port,
                    remote_addr: row.remote_addr,
                    remote_port: row.remote_port,
                    inode,
                });
            }
        }

        Ok(map)
    }
}

/// Ports are stored in network byte order in the low 16 bits of a DWORD
fn port_from_dword(raw: u32) -> u16 {
    u16::from_be(raw as u16)
}

/// Query a table twice: once for its size, once for the data
fn fetch_table(
    af: u32,
    fetch: impl Fn(Option<*mut core::ffi::c_void>, &mut u32, u32) -> u32,
) -> Result<Vec<u8>> {
    let mut size: u32 = 0;
    let _ = fetch(None, &mut size, af);
    if size == 0 {
        return Ok(Vec::new());
    }

    let mut buffer = vec![0u8; size as usize];
    let result = fetch(Some(buffer.as_mut_ptr() as *mut _), &mut size, af);
    if result != NO_ERROR.0 {
        anyhow::bail!("IP Helper table query failed with error code: {}", result);
    }
    Ok(buffer)
}

fn tcp_buffer(af: u32) -> Result<Vec<u8>> {
    fetch_table(af, |buf, size, af| unsafe {
        GetExtendedTcpTable(buf, size, false, af, TCP_TABLE_OWNER_PID_ALL, 0)
    })
}

fn udp_buffer(af: u32) -> Result<Vec<u8>> {
    fetch_table(af, |buf, size, af| unsafe {
        GetExtendedUdpTable(buf, size, false, af, UDP_TABLE_OWNER_PID, 0)
    })
}

fn get_tcp_table() -> Result<Vec<OwnedEndpoint>> {
    let buffer = tcp_buffer(AF_INET.0 as u32)?;
    if buffer.is_empty() {
        return Ok(Vec::new());
    }

    // SAFETY: the API filled the buffer with a MIB_TCPTABLE_OWNER_PID
    let table = unsafe { &*(buffer.as_ptr() as *const MIB_TCPTABLE_OWNER_PID) };
    let rows = unsafe {
        std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
    };

    Ok(rows
        .iter()
        .map(|row| OwnedEndpoint {
            local_addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(row.dwLocalAddr))),
            local_port: port_from_dword(row.dwLocalPort),
            remote_addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(row.dwRemoteAddr))),
            remote_port: port_from_dword(row.dwRemotePort),
            pid: row.dwOwningPid as i32,
        })
        .collect())
}

fn get_tcp6_table() -> Result<Vec<OwnedEndpoint>> {
    let buffer = tcp_buffer(AF_INET6.0 as u32)?;
    if buffer.is_empty() {
        return Ok(Vec::new());
    }

    // SAFETY: the API filled the buffer with a MIB_TCP6TABLE_OWNER_PID
    let table = unsafe { &*(buffer.as_ptr() as *const MIB_TCP6TABLE_OWNER_PID) };
    let rows = unsafe {
        std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
    };

    Ok(rows
        .iter()
        .map(|row| OwnedEndpoint {
            local_addr: IpAddr::V6(Ipv6Addr::from(row.ucLocalAddr)),
            local_port: port_from_dword(row.dwLocalPort),
            remote_addr: IpAddr::V6(Ipv6Addr::from(row.ucRemoteAddr)),
            remote_port: port_from_dword(row.dwRemotePort),
            pid: row.dwOwningPid as i32,
        })
        .collect())
}

fn get_udp_table() -> Result<Vec<OwnedEndpoint>> {
    let buffer = udp_buffer(AF_INET.0 as u32)?;
    if buffer.is_empty() {
        return Ok(Vec::new());
    }

    // SAFETY: the API filled the buffer with a MIB_UDPTABLE_OWNER_PID
    let table = unsafe { &*(buffer.as_ptr() as *const MIB_UDPTABLE_OWNER_PID) };
    let rows = unsafe {
        std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
    };

    Ok(rows
        .iter()
        .map(|row| OwnedEndpoint {
            local_addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(row.dwLocalAddr))),
            local_port: port_from_dword(row.dwLocalPort),
            remote_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_port: 0,
            pid: row.dwOwningPid as i32,
        })
        .collect())
}

fn get_udp6_table() -> Result<Vec<OwnedEndpoint>> {
    let buffer = udp_buffer(AF_INET6.0 as u32)?;
    if buffer.is_empty() {
        return Ok(Vec::new());
    }

    // SAFETY: the API filled the buffer with a MIB_UDP6TABLE_OWNER_PID
    let table = unsafe { &*(buffer.as_ptr() as *const MIB_UDP6TABLE_OWNER_PID) };
    let rows = unsafe {
        std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
    };

    Ok(rows
        .iter()
        .map(|row| OwnedEndpoint {
            local_addr: IpAddr::V6(Ipv6Addr::from(row.ucLocalAddr)),
            local_port: port_from_dword(row.dwLocalPort),
            remote_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            remote_port: 0,
            pid: row.dwOwningPid as i32,
        })
        .collect())
}

/// Deterministic stand-in for a socket inode, hashed from the endpoint tuple
fn synthetic_inode(
    local_addr: &IpAddr,
    local_port: u16,
    remote_addr: &IpAddr,
    remote_port: u16,
) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    local_addr.hash(&mut hasher);
    local_port.hash(&mut hasher);
    remote_addr.hash(&mut hasher);
    remote_port.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_from_dword() {
        // 443 in network byte order occupies the low word as 0xBB01
        assert_eq!(port_from_dword(0x0000_BB01), 443);
        assert_eq!(port_from_dword(0x0000_0000), 0);
    }

    #[test]
    fn test_synthetic_inode_is_stable() {
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(synthetic_inode(&a, 1, &b, 2), synthetic_inode(&a, 1, &b, 2));
        assert_ne!(synthetic_inode(&a, 1, &b, 2), synthetic_inode(&a, 2, &b, 2));
    }
}
