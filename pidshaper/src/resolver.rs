//! Packet-to-process attribution against the live socket table.

use crate::backends::process::{ConnectionMap, ProcessUtils};
use crate::process::PacketTuple;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Find the process owning an outbound packet in a connection table.
///
/// Matches on local port first. A record without a remote endpoint (listening
/// or unconnected UDP socket) matches on the port alone; otherwise the remote
/// address and port must equal the packet's destination. The first match in
/// enumeration order wins.
///
/// Protocol is deliberately not compared: a TCP and a UDP socket sharing a local
/// port are ambiguous and the earlier one is returned.
pub fn match_connection(map: &ConnectionMap, tuple: &PacketTuple) -> Option<i32> {
    map.iter()
        .filter(|conn| conn.local_port == tuple.src_port)
        .filter(|conn| {
            !conn.has_remote()
                || (conn.remote_addr == tuple.dst_addr && conn.remote_port == tuple.dst_port)
        })
        // Socket closed after the table was read: keep looking
        .find_map(|conn| map.owner(conn))
}

/// Resolves packets to PIDs, re-reading the socket table at most once per `cache_ttl`.
pub struct ProcessResolver {
    process_utils: Arc<dyn ProcessUtils>,
    cache_ttl: Duration,
    cached: Option<(Instant, ConnectionMap)>,
}

impl ProcessResolver {
    pub fn new(process_utils: Arc<dyn ProcessUtils>, cache_ttl: Duration) -> Self {
        Self {
            process_utils,
            cache_ttl,
            cached: None,
        }
    }

    /// Resolve the owning PID of a packet.
    ///
    /// Never fails: an OS error while reading the socket table is logged and the
    /// packet is reported as unresolved.
    pub fn resolve(&mut self, tuple: &PacketTuple) -> Option<i32> {
        let now = Instant::now();

        if let Some((read_at, map)) = &self.cached {
            // Sockets opened since the last read stay unresolved until the table
            // expires, which only lets their first few packets through unshaped
            if now.duration_since(*read_at) < self.cache_ttl {
                return match_connection(map, tuple);
            }
        }

        match self.process_utils.get_connection_map() {
            Ok(map) => {
                log::trace!("Read {} sockets from {}", map.len(), self.process_utils.socket_mapper_name());
                let pid = match_connection(&map, tuple);
                self.cached = Some((now, map));
                pid
            }
            Err(e) => {
                log::debug!("Connection table unavailable, packet left unresolved: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backends::process::{ConnectionEntry, ProcessEntry};
    use crate::process::Protocol;
    use anyhow::Result;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory process table and socket table
    #[derive(Default)]
    pub(crate) struct FakeProcessUtils {
        pub processes: Mutex<Vec<ProcessEntry>>,
        pub connections: Mutex<Option<ConnectionMap>>,
        pub map_reads: AtomicUsize,
    }

    impl FakeProcessUtils {
        pub(crate) fn with_processes(processes: &[(i32, Option<i32>, &str)]) -> Self {
            let fake = Self::default();
            *fake.processes.lock().unwrap() = processes
                .iter()
                .map(|(pid, parent_pid, name)| ProcessEntry {
                    pid: *pid,
                    parent_pid: *parent_pid,
                    name: name.to_string(),
                })
                .collect();
            fake
        }

        pub(crate) fn set_connections(&self, map: Option<ConnectionMap>) {
            *self.connections.lock().unwrap() = map;
        }
    }

    impl ProcessUtils for FakeProcessUtils {
        fn get_process_name(&self, pid: i32) -> Result<String> {
            Ok(self
                .processes
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.pid == pid)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| format!("PID {}", pid)))
        }

        fn process_exists(&self, pid: i32) -> bool {
            self.processes.lock().unwrap().iter().any(|p| p.pid == pid)
        }

        fn get_all_processes(&self) -> Result<Vec<ProcessEntry>> {
            Ok(self.processes.lock().unwrap().clone())
        }

        fn get_connection_map(&self) -> Result<ConnectionMap> {
            self.map_reads.fetch_add(1, Ordering::SeqCst);
            self.connections
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("socket table unreadable"))
        }

        fn socket_mapper_name(&self) -> &str {
            "fake"
        }
    }

    pub(crate) fn conn(local_port: u16, remote: Option<(&str, u16)>, inode: u64) -> ConnectionEntry {
        let (remote_addr, remote_port) = match remote {
            Some((addr, port)) => (addr.parse().unwrap(), port),
            None => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        };
        ConnectionEntry {
            local_addr: "192.168.1.10".parse().unwrap(),
            local_port,
            remote_addr,
            remote_port,
            inode,
        }
    }

    pub(crate) fn tuple(src_port: u16, dst: &str, dst_port: u16) -> PacketTuple {
        PacketTuple {
            protocol: Protocol::Tcp,
            src_addr: "192.168.1.10".parse().unwrap(),
            src_port,
            dst_addr: dst.parse().unwrap(),
            dst_port,
        }
    }

    fn owned(map: &mut ConnectionMap, inode: u64, pid: i32) {
        map.socket_to_pid.insert(inode, (pid, format!("proc{}", pid)));
    }

    #[test]
    fn test_match_requires_remote_when_present() {
        let mut map = ConnectionMap::default();
        map.tcp_connections.push(conn(50000, Some(("1.1.1.1", 443)), 1));
        owned(&mut map, 1, 100);

        assert_eq!(match_connection(&map, &tuple(50000, "1.1.1.1", 443)), Some(100));
        assert_eq!(match_connection(&map, &tuple(50000, "8.8.8.8", 443)), None);
        assert_eq!(match_connection(&map, &tuple(50000, "1.1.1.1", 80)), None);
        assert_eq!(match_connection(&map, &tuple(50001, "1.1.1.1", 443)), None);
    }

    #[test]
    fn test_match_port_only_without_remote() {
        let mut map = ConnectionMap::default();
        map.udp_connections.push(conn(5353, None, 7));
        owned(&mut map, 7, 300);

        assert_eq!(match_connection(&map, &tuple(5353, "224.0.0.251", 5353)), Some(300));
    }

    #[test]
    fn test_match_first_in_enumeration_order() {
        let mut map = ConnectionMap::default();
        map.tcp_connections.push(conn(4000, None, 1));
        map.udp_connections.push(conn(4000, None, 2));
        owned(&mut map, 1, 10);
        owned(&mut map, 2, 20);

        assert_eq!(match_connection(&map, &tuple(4000, "9.9.9.9", 1)), Some(10));
    }

    #[test]
    fn test_match_skips_unowned_socket() {
        let mut map = ConnectionMap::default();
        map.tcp_connections.push(conn(4000, Some(("9.9.9.9", 1)), 1));
        map.udp_connections.push(conn(4000, None, 2));
        owned(&mut map, 2, 20);

        assert_eq!(match_connection(&map, &tuple(4000, "9.9.9.9", 1)), Some(20));
    }

    #[test]
    fn test_resolve_absorbs_os_failure() {
        let utils = Arc::new(FakeProcessUtils::default());
        let mut resolver = ProcessResolver::new(utils, Duration::ZERO);

        assert_eq!(resolver.resolve(&tuple(1234, "1.2.3.4", 80)), None);
    }

    #[test]
    fn test_resolve_uses_cache_for_known_sockets() {
        let utils = Arc::new(FakeProcessUtils::default());
        let mut map = ConnectionMap::default();
        map.tcp_connections.push(conn(50000, Some(("1.1.1.1", 443)), 1));
        owned(&mut map, 1, 100);
        utils.set_connections(Some(map));

        let mut resolver = ProcessResolver::new(utils.clone(), Duration::from_secs(60));
        assert_eq!(resolver.resolve(&tuple(50000, "1.1.1.1", 443)), Some(100));
        assert_eq!(resolver.resolve(&tuple(50000, "1.1.1.1", 443)), Some(100));
        assert_eq!(utils.map_reads.load(Ordering::SeqCst), 1);

        // Unknown sockets are answered from the same table
        assert_eq!(resolver.resolve(&tuple(60000, "1.1.1.1", 443)), None);
        assert_eq!(utils.map_reads.load(Ordering::SeqCst), 1);

        let mut resolver = ProcessResolver::new(utils.clone(), Duration::from_secs(60));
        assert_eq!(resolver.resolve(&tuple(50000, "1.1.1.1", 443)), Some(100));
        assert_eq!(utils.map_reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resolve_without_cache_reads_every_time() {
        let utils = Arc::new(FakeProcessUtils::default());
        utils.set_connections(Some(ConnectionMap::default()));
        let mut resolver = ProcessResolver::new(utils.clone(), Duration::ZERO);

        resolver.resolve(&tuple(1, "1.1.1.1", 1));
        resolver.resolve(&tuple(1, "1.1.1.1", 1));
        assert_eq!(utils.map_reads.load(Ordering::SeqCst), 2);
    }
}
