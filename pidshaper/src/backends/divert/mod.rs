// Packet divert backends
//
// A divert backend takes packets out of the kernel's outbound path, hands them
// to userspace, and puts them back when asked. Nothing leaves the host until
// it is re-injected, which is what lets the shaper delay traffic.
// - Linux: NFQUEUE fed by an nftables output hook (feature "divert-nfqueue")
// - Windows: WinDivert network layer (feature "divert-windivert")

use super::BackendPriority;
use anyhow::Result;
use std::time::Duration;

#[cfg(all(target_os = "linux", feature = "divert-nfqueue"))]
pub mod linux;

#[cfg(all(target_os = "windows", feature = "divert-windivert"))]
pub mod windows;

/// Filter used for every capture: all outbound IPv4 traffic
pub const OUTBOUND_IPV4_FILTER: &str = "outbound and ip";

/// What a backend needs to put a packet back where it came from
pub enum ReinjectToken {
    /// No backend state (packets built in-process)
    Detached,

    #[cfg(all(target_os = "linux", feature = "divert-nfqueue"))]
    Nfqueue(nfq::Message),

    #[cfg(all(target_os = "windows", feature = "divert-windivert"))]
    WinDivert(::windivert::address::WinDivertAddress<::windivert::layer::NetworkLayer>),
}

/// A packet held back from the kernel
pub struct DivertedPacket {
    pub data: Vec<u8>,
    pub token: ReinjectToken,
}

impl DivertedPacket {
    pub fn detached(data: Vec<u8>) -> Self {
        Self {
            data,
            token: ReinjectToken::Detached,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An open capture. Closing happens on drop, after which the kernel stops
/// diverting and traffic flows normally again.
pub trait DivertHandle: Send {
    /// Wait up to `timeout` for the next packet. `Ok(None)` means nothing
    /// arrived; `Err` means the handle itself is broken.
    fn recv(&mut self, timeout: Duration) -> Result<Option<DivertedPacket>>;

    /// Re-inject a packet exactly as received
    fn send(&mut self, packet: DivertedPacket) -> Result<()>;
}

/// Kernel packet divert backend trait
pub trait DivertBackend: Send + Sync {
    /// Backend name (e.g., "nfqueue", "windivert")
    fn name(&self) -> &'static str;

    /// Backend priority for auto-selection
    fn priority(&self) -> BackendPriority;

    /// Check if this backend is available on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Start diverting packets matching `filter`
    fn open(&self, filter: &str) -> Result<Box<dyn DivertHandle>>;
}

/// Divert backend metadata for selection
#[derive(Debug, Clone)]
pub struct DivertBackendInfo {
    pub name: &'static str,
    pub priority: BackendPriority,
    pub available: bool,
}

/// Detect all divert backends compiled into this build
pub fn detect_divert_backends() -> Vec<DivertBackendInfo> {
    #[allow(unused_mut)]
    let mut backends = Vec::new();

    #[cfg(all(target_os = "linux", feature = "divert-nfqueue"))]
    {
        backends.push(DivertBackendInfo {
            name: "nfqueue",
            priority: BackendPriority::Best,
            available: linux::NfqueueDivert::is_available(),
        });
    }

    #[cfg(all(target_os = "windows", feature = "divert-windivert"))]
    {
        backends.push(DivertBackendInfo {
            name: "windivert",
            priority: BackendPriority::Best,
            available: windows::WinDivertBackend::is_available(),
        });
    }

    backends
}

/// Auto-select best available divert backend (returns None if unavailable)
pub fn select_divert_backend(preference: Option<&str>) -> Option<Box<dyn DivertBackend>> {
    if let Some(name) = preference {
        log::info!("Using preferred divert backend: {}", name);
        return create_divert_backend(name)
            .map_err(|e| log::error!("Cannot use divert backend {}: {:#}", name, e))
            .ok();
    }

    let available = detect_divert_backends();

    log::debug!("Available divert backends:");
    for backend in &available {
        log::debug!(
            "  {} - priority: {:?}, available: {}",
            backend.name,
            backend.priority,
            backend.available
        );
    }

    let selected = available
        .iter()
        .filter(|b| b.available)
        .max_by_key(|b| b.priority)
        .and_then(|info| {
            log::info!("Auto-selected divert backend: {}", info.name);
            create_divert_backend(info.name).ok()
        });

    if selected.is_none() {
        log::error!("No packet divert backend available (build with linux-full or windows-full)");
    }

    selected
}

/// Create a divert backend by name
pub fn create_divert_backend(name: &str) -> Result<Box<dyn DivertBackend>> {
    log::debug!("Creating divert backend {name}");
    match name {
        #[cfg(all(target_os = "linux", feature = "divert-nfqueue"))]
        "nfqueue" => Ok(Box::new(linux::NfqueueDivert::new()?)),

        #[cfg(all(target_os = "windows", feature = "divert-windivert"))]
        "windivert" => Ok(Box::new(windows::WinDivertBackend::new()?)),

        _ => Err(anyhow::anyhow!("Unknown divert backend: {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(create_divert_backend("pcap").is_err());
        assert!(select_divert_backend(Some("pcap")).is_none());
    }

    #[test]
    fn test_detected_backends_are_known() {
        for info in detect_divert_backends() {
            assert!(["nfqueue", "windivert"].contains(&info.name));
        }
    }
}
