use super::ForegroundProvider;
use crate::backends::BackendPriority;
use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

pub struct Win32Foreground;

impl ForegroundProvider for Win32Foreground {
    fn name(&self) -> &'static str {
        "win32"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Best
    }

    fn is_available() -> bool {
        true
    }

    fn foreground_pid(&self) -> Option<i32> {
        // SAFETY: both calls only read window manager state; a null window is
        // handled before it is passed on
        unsafe {
            let hwnd = GetForegroundWindow();
            if hwnd.0.is_null() {
                return None;
            }
            let mut pid: u32 = 0;
            GetWindowThreadProcessId(hwnd, Some(&mut pid as *mut u32));
            (pid != 0).then_some(pid as i32)
        }
    }
}
