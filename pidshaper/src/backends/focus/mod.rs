// Foreground window backends
//
// Answer one question: which process owns the window that currently has
// keyboard focus?
// - Linux: xdotool (X11 only)
// - Windows: GetForegroundWindow + GetWindowThreadProcessId

use super::BackendPriority;
use anyhow::Result;

/// Reports the PID owning the focused window
pub trait ForegroundProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> BackendPriority;

    fn is_available() -> bool
    where
        Self: Sized;

    /// `None` when no window has focus or the lookup failed
    fn foreground_pid(&self) -> Option<i32>;
}

#[derive(Debug, Clone)]
pub struct ForegroundInfo {
    pub name: &'static str,
    pub priority: BackendPriority,
    pub available: bool,
}

#[cfg(target_os = "linux")]
mod xdotool;

#[cfg(target_os = "linux")]
pub use xdotool::XdotoolForeground;

#[cfg(target_os = "windows")]
mod win32;

#[cfg(target_os = "windows")]
pub use win32::Win32Foreground;

pub fn detect_foreground_providers() -> Vec<ForegroundInfo> {
    let mut providers = Vec::new();

    #[cfg(target_os = "linux")]
    providers.push(ForegroundInfo {
        name: "xdotool",
        priority: BackendPriority::Fallback,
        available: XdotoolForeground::is_available(),
    });

    #[cfg(target_os = "windows")]
    providers.push(ForegroundInfo {
        name: "win32",
        priority: BackendPriority::Best,
        available: Win32Foreground::is_available(),
    });

    providers
}

pub fn create_foreground_provider(name: &str) -> Result<Box<dyn ForegroundProvider>> {
    match name {
        #[cfg(target_os = "linux")]
        "xdotool" => Ok(Box::new(XdotoolForeground)),

        #[cfg(target_os = "windows")]
        "win32" => Ok(Box::new(Win32Foreground)),

        _ => Err(anyhow::anyhow!("Unknown foreground provider: {}", name)),
    }
}

/// Pick the best working provider, if any. Focus mode without one only ever
/// produces "no target" warnings.
pub fn select_foreground_provider() -> Option<Box<dyn ForegroundProvider>> {
    let selected = detect_foreground_providers()
        .into_iter()
        .filter(|p| p.available)
        .max_by_key(|p| p.priority)
        .and_then(|info| {
            log::info!("Auto-selected foreground provider: {}", info.name);
            create_foreground_provider(info.name).ok()
        });

    if selected.is_none() {
        log::warn!("No foreground window provider available, focus mode disabled");
    }

    selected
}
