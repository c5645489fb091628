use super::ForegroundProvider;
use crate::backends::BackendPriority;
use std::process::Command;

/// Asks the X server through `xdotool getactivewindow getwindowpid`
pub struct XdotoolForeground;

impl ForegroundProvider for XdotoolForeground {
    fn name(&self) -> &'static str {
        "xdotool"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Fallback
    }

    fn is_available() -> bool {
        std::env::var_os("DISPLAY").is_some()
            && Command::new("xdotool").arg("--version").output().is_ok()
    }

    fn foreground_pid(&self) -> Option<i32> {
        let output = Command::new("xdotool")
            .args(["getactivewindow", "getwindowpid"])
            .output()
            .map_err(|e| log::debug!("xdotool failed to run: {}", e))
            .ok()?;

        if !output.status.success() {
            log::debug!(
                "xdotool found no focused window: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        parse_pid(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_pid(stdout: &str) -> Option<i32> {
    stdout.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("4242\n"), Some(4242));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("0"), None);
        assert_eq!(parse_pid("not a pid"), None);
    }
}
