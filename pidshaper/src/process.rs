use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Transport protocol of an intercepted packet
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Addressing of an outbound packet, as seen from this host.
///
/// `src_*` is always the local end, `dst_*` the remote end.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct PacketTuple {
    pub protocol: Protocol,
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
}

/// Which process a toggle should act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    /// Whichever window currently has input focus
    Focus,
    /// A previously chosen process
    #[default]
    Fixed,
}

impl TargetMode {
    pub fn toggled(self) -> Self {
        match self {
            TargetMode::Focus => TargetMode::Fixed,
            TargetMode::Fixed => TargetMode::Focus,
        }
    }
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetMode::Focus => write!(f, "focus"),
            TargetMode::Fixed => write!(f, "fixed"),
        }
    }
}

impl std::str::FromStr for TargetMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "focus" | "foreground" => Ok(TargetMode::Focus),
            "fixed" | "pid" => Ok(TargetMode::Fixed),
            other => Err(anyhow::anyhow!("Unknown target mode: {}", other)),
        }
    }
}

pub fn format_rate(bytes_per_sec: u64) -> String {
    if bytes_per_sec < 1024 {
        format!("{} B/s", bytes_per_sec)
    } else if bytes_per_sec < 1024 * 1024 {
        format!("{:.1} KB/s", bytes_per_sec as f64 / 1024.0)
    } else if bytes_per_sec < 1024 * 1024 * 1024 {
        format!("{:.1} MB/s", bytes_per_sec as f64 / (1024.0 * 1024.0))
    } else {
        format!(
            "{:.1} GB/s",
            bytes_per_sec as f64 / (1024.0 * 1024.0 * 1024.0)
        )
    }
}

/// Parse a bandwidth limit string (e.g., "1M", "500K", "1.5MB") to bytes per second.
///
/// A bare number is taken as bytes. Zero, negative and non-finite values are
/// rejected so the shaper never sees a rate it cannot divide by.
pub fn parse_rate(limit_str: &str) -> anyhow::Result<u64> {
    let limit_str = limit_str.trim().to_uppercase();
    let limit_str = limit_str.trim_end_matches("/S");

    let (num_str, multiplier) = if let Some(n) = limit_str
        .strip_suffix("GB")
        .or_else(|| limit_str.strip_suffix('G'))
    {
        (n, 1024.0 * 1024.0 * 1024.0)
    } else if let Some(n) = limit_str
        .strip_suffix("MB")
        .or_else(|| limit_str.strip_suffix('M'))
    {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = limit_str
        .strip_suffix("KB")
        .or_else(|| limit_str.strip_suffix('K'))
    {
        (n, 1024.0)
    } else if let Some(n) = limit_str.strip_suffix('B') {
        (n, 1.0)
    } else {
        (limit_str, 1.0)
    };

    let number: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bandwidth limit: {}", limit_str))?;

    let bytes_per_sec = number * multiplier;
    if !bytes_per_sec.is_finite() || bytes_per_sec < 1.0 {
        anyhow::bail!("Bandwidth limit must be at least 1 B/s, got {}", limit_str);
    }

    Ok(bytes_per_sec as u64)
}
