// Windows ProcessUtils implementation using sysinfo and IP Helper API
//
// This provides process enumeration and socket-to-PID mapping for Windows.

use super::socket_mapper::{SocketMapper, select_socket_mapper};
use super::{ConnectionMap, ProcessEntry, ProcessUtils};
use anyhow::Result;
use std::sync::Mutex;
use sysinfo::{Pid, System};

pub struct WindowsProcessUtils {
    socket_mapper: Box<dyn SocketMapper>,
    // System::new_all() costs 10-20ms, so one instance is kept and refreshed on demand
    cached_system: Mutex<System>,
}

impl WindowsProcessUtils {
    pub fn with_socket_mapper(socket_mapper_preference: Option<&str>) -> Result<Self> {
        let socket_mapper = select_socket_mapper(socket_mapper_preference)?;
        log::debug!("Using socket mapper backend: {}", socket_mapper.name());

        Ok(Self {
            socket_mapper,
            cached_system: Mutex::new(System::new_all()),
        })
    }

    fn with_refreshed_system<T>(&self, f: impl FnOnce(&System) -> T) -> T {
        let mut sys = self
            .cached_system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sys.refresh_all();
        f(&sys)
    }
}

impl ProcessUtils for WindowsProcessUtils {
    fn get_process_name(&self, pid: i32) -> Result<String> {
        let sys = self
            .cached_system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok(sys
            .process(Pid::from_u32(pid as u32))
            .map(|p| p.name().to_string_lossy().to_string())
            .unwrap_or_else(|| format!("PID {}", pid)))
    }

    fn process_exists(&self, pid: i32) -> bool {
        self.with_refreshed_system(|sys| sys.process(Pid::from_u32(pid as u32)).is_some())
    }

    fn get_all_processes(&self) -> Result<Vec<ProcessEntry>> {
        let entries = self.with_refreshed_system(|sys| {
            sys.processes()
                .iter()
                .map(|(pid, proc)| ProcessEntry {
                    pid: pid.as_u32() as i32,
                    parent_pid: proc.parent().map(|p| p.as_u32() as i32),
                    name: proc.name().to_string_lossy().to_string(),
                })
                .collect()
        });

        Ok(entries)
    }

    fn get_connection_map(&self) -> Result<ConnectionMap> {
        self.socket_mapper.read_table()
    }

    fn socket_mapper_name(&self) -> &str {
        self.socket_mapper.name()
    }
}
