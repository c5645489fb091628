// Linux-specific process utilities using procfs

use super::socket_mapper::{SocketMapper, select_socket_mapper};
use super::{ConnectionMap, ProcessEntry, ProcessUtils};
use anyhow::Result;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use procfs::process::all_processes;

/// Linux process utilities with pluggable socket mapping
pub struct LinuxProcessUtils {
    socket_mapper: Box<dyn SocketMapper>,
}

impl LinuxProcessUtils {
    /// Create with a specific socket mapper backend
    pub fn with_socket_mapper(backend_name: Option<&str>) -> Result<Self> {
        let socket_mapper = select_socket_mapper(backend_name)?;

        log::debug!("Using socket mapper backend: {}", socket_mapper.name());

        Ok(Self { socket_mapper })
    }
}

impl ProcessUtils for LinuxProcessUtils {
    fn get_process_name(&self, pid: i32) -> Result<String> {
        std::fs::read_to_string(format!("/proc/{}/comm", pid))
            .map(|s| s.trim().to_string())
            .or_else(|_| Ok(format!("PID {}", pid)))
    }

    fn process_exists(&self, pid: i32) -> bool {
        // Signal 0 only checks for existence; EPERM still means the process is there
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn get_all_processes(&self) -> Result<Vec<ProcessEntry>> {
        let mut entries = Vec::new();

        for process in all_processes()?.flatten() {
            let pid = process.pid();
            // Processes can exit between listing and reading stat
            let Ok(stat) = process.stat() else {
                continue;
            };
            entries.push(ProcessEntry {
                pid,
                parent_pid: (stat.ppid > 0).then_some(stat.ppid),
                name: stat.comm,
            });
        }

        Ok(entries)
    }

    fn get_connection_map(&self) -> Result<ConnectionMap> {
        self.socket_mapper.read_table()
    }

    fn socket_mapper_name(&self) -> &str {
        self.socket_mapper.name()
    }
}
