/// Centralized keybinding definitions for pidshaper
/// This ensures the help menu, status bar, and actual key handlers stay in sync
use anyhow::{Result, anyhow};
use crossterm::event::KeyCode;

#[derive(Debug, Clone)]
pub struct KeyBinding {
    pub key: &'static str,
    pub description: &'static str,
    pub category: KeyCategory,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyCategory {
    Shaping,
    Target,
    System,
}

impl KeyCategory {
    pub fn title(&self) -> &'static str {
        match self {
            KeyCategory::Shaping => "Shaping",
            KeyCategory::Target => "Target",
            KeyCategory::System => "System",
        }
    }
}

/// Get all keybindings. The toggle hotkey is configurable and listed separately.
pub fn get_all_keybindings() -> Vec<KeyBinding> {
    vec![
        // Shaping
        KeyBinding {
            key: "s",
            description: "Start/stop packet interception",
            category: KeyCategory::Shaping,
        },
        KeyBinding {
            key: "+",
            description: "Double the rate limit",
            category: KeyCategory::Shaping,
        },
        KeyBinding {
            key: "-",
            description: "Halve the rate limit",
            category: KeyCategory::Shaping,
        },
        // Target
        KeyBinding {
            key: "p",
            description: "Pick next process as fixed target",
            category: KeyCategory::Target,
        },
        KeyBinding {
            key: "m",
            description: "Switch target mode (focus targets this terminal while the panel has focus)",
            category: KeyCategory::Target,
        },
        // System
        KeyBinding {
            key: "h/?",
            description: "Toggle this help",
            category: KeyCategory::System,
        },
        KeyBinding {
            key: "q/Esc",
            description: "Quit (or close help if open)",
            category: KeyCategory::System,
        },
        KeyBinding {
            key: "Ctrl+C",
            description: "Force quit (always exits)",
            category: KeyCategory::System,
        },
    ]
}

/// Get keybindings for the status bar (most common ones)
pub fn get_status_bar_keybindings() -> Vec<(&'static str, &'static str)> {
    vec![
        ("s", "Start/Stop"),
        ("+/-", "Rate"),
        ("p", "Pick"),
        ("m", "Mode"),
        ("h", "Help"),
        ("q", "Quit"),
    ]
}

/// Parse a configured hotkey name ("f2", "t", "space") into a terminal key code
pub fn parse_hotkey(name: &str) -> Result<KeyCode> {
    let name = name.trim().to_lowercase();

    if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
        if (1..=12).contains(&n) {
            return Ok(KeyCode::F(n));
        }
        return Err(anyhow!("Function key out of range: {}", name));
    }

    match name.as_str() {
        "space" => return Ok(KeyCode::Char(' ')),
        "tab" => return Ok(KeyCode::Tab),
        "insert" => return Ok(KeyCode::Insert),
        "pause" => return Ok(KeyCode::Pause),
        _ => {}
    }

    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if is_reserved(c) => {
            Err(anyhow!("Hotkey '{}' is already bound to another action", c))
        }
        (Some(c), None) => Ok(KeyCode::Char(c)),
        _ => Err(anyhow!("Unsupported hotkey: {}", name)),
    }
}

fn is_reserved(c: char) -> bool {
    matches!(c, 's' | '+' | '=' | '-' | 'p' | 'm' | 'h' | '?' | 'q')
}

/// Display form of a hotkey, e.g. "F2"
pub fn hotkey_label(code: KeyCode) -> String {
    match code {
        KeyCode::F(n) => format!("F{}", n),
        KeyCode::Char(' ') => "Space".to_string(),
        KeyCode::Char(c) => c.to_uppercase().to_string(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hotkey() {
        assert_eq!(parse_hotkey("f2").unwrap(), KeyCode::F(2));
        assert_eq!(parse_hotkey(" F12 ").unwrap(), KeyCode::F(12));
        assert_eq!(parse_hotkey("t").unwrap(), KeyCode::Char('t'));
        assert_eq!(parse_hotkey("space").unwrap(), KeyCode::Char(' '));
        // Bare "f" is a character key, not a function key
        assert_eq!(parse_hotkey("f").unwrap(), KeyCode::Char('f'));
    }

    #[test]
    fn test_parse_hotkey_rejects() {
        assert!(parse_hotkey("f13").is_err());
        assert!(parse_hotkey("ctrl+alt+x").is_err());
        assert!(parse_hotkey("q").is_err());
        assert!(parse_hotkey("").is_err());
    }

    #[test]
    fn test_hotkey_label() {
        assert_eq!(hotkey_label(KeyCode::F(2)), "F2");
        assert_eq!(hotkey_label(KeyCode::Char('t')), "T");
    }

    #[test]
    fn test_help_lists_every_status_bar_key() {
        let all: Vec<&str> = get_all_keybindings().iter().map(|k| k.key).collect();
        for (key, _) in get_status_bar_keybindings() {
            let first = key.split('/').next().unwrap();
            assert!(all.iter().any(|k| k.contains(first)), "{} missing from help", key);
        }
    }
}
