//! Key name resolution
//!
//! Configuration files name keys the way people write them (`Esc`, `F12`,
//! `LeftAlt`). This module maps those names onto evdev key codes. Raw kernel
//! names such as `KEY_F13` or `BTN_0` are accepted as an escape hatch.

use std::str::FromStr;

use evdev::Key;

/// Resolve a key name (case-insensitive) to an evdev key.
pub fn parse_key(name: &str) -> Option<Key> {
    let upper = name.trim().to_uppercase();

    match upper.as_str() {
        "ESCAPE" | "ESC" => Some(Key::KEY_ESC),
        "ENTER" | "RETURN" => Some(Key::KEY_ENTER),
        "TAB" => Some(Key::KEY_TAB),
        "SPACE" => Some(Key::KEY_SPACE),
        "BACKSPACE" => Some(Key::KEY_BACKSPACE),
        "CAPSLOCK" | "CAPS_LOCK" | "CAPS" => Some(Key::KEY_CAPSLOCK),

        // Modifiers
        "LEFTCTRL" | "LCTRL" | "CTRL" => Some(Key::KEY_LEFTCTRL),
        "RIGHTCTRL" | "RCTRL" => Some(Key::KEY_RIGHTCTRL),
        "LEFTSHIFT" | "LSHIFT" | "SHIFT" => Some(Key::KEY_LEFTSHIFT),
        "RIGHTSHIFT" | "RSHIFT" => Some(Key::KEY_RIGHTSHIFT),
        "LEFTALT" | "LALT" | "ALT" => Some(Key::KEY_LEFTALT),
        "RIGHTALT" | "RALT" | "ALTGR" => Some(Key::KEY_RIGHTALT),
        "LEFTMETA" | "LMETA" | "SUPER" | "META" => Some(Key::KEY_LEFTMETA),
        "RIGHTMETA" | "RMETA" => Some(Key::KEY_RIGHTMETA),

        // Arrows and navigation
        "UP" => Some(Key::KEY_UP),
        "DOWN" => Some(Key::KEY_DOWN),
        "LEFT" => Some(Key::KEY_LEFT),
        "RIGHT" => Some(Key::KEY_RIGHT),
        "HOME" => Some(Key::KEY_HOME),
        "END" => Some(Key::KEY_END),
        "PAGEUP" | "PGUP" => Some(Key::KEY_PAGEUP),
        "PAGEDOWN" | "PGDN" => Some(Key::KEY_PAGEDOWN),
        "INSERT" | "INS" => Some(Key::KEY_INSERT),
        "DELETE" | "DEL" => Some(Key::KEY_DELETE),
        "PAUSE" => Some(Key::KEY_PAUSE),
        "SYSRQ" | "PRINTSCREEN" => Some(Key::KEY_SYSRQ),
        "SCROLLLOCK" => Some(Key::KEY_SCROLLLOCK),
        "NUMLOCK" => Some(Key::KEY_NUMLOCK),

        // Symbols
        "MINUS" | "-" => Some(Key::KEY_MINUS),
        "EQUAL" | "EQUALS" | "=" => Some(Key::KEY_EQUAL),
        "LEFTBRACE" | "[" => Some(Key::KEY_LEFTBRACE),
        "RIGHTBRACE" | "]" => Some(Key::KEY_RIGHTBRACE),
        "SEMICOLON" | ";" => Some(Key::KEY_SEMICOLON),
        "APOSTROPHE" | "'" => Some(Key::KEY_APOSTROPHE),
        "GRAVE" | "`" => Some(Key::KEY_GRAVE),
        "BACKSLASH" | "\\" => Some(Key::KEY_BACKSLASH),
        "COMMA" | "," => Some(Key::KEY_COMMA),
        "DOT" | "PERIOD" | "." => Some(Key::KEY_DOT),
        "SLASH" | "/" => Some(Key::KEY_SLASH),

        _ => parse_single_char(&upper)
            .or_else(|| parse_function_key(&upper))
            .or_else(|| parse_raw_code(&upper)),
    }
}

/// Resolve every name in a sequence, reporting the first unknown one.
pub fn parse_key_sequence<S: AsRef<str>>(names: &[S]) -> Result<Vec<Key>, String> {
    names
        .iter()
        .map(|name| parse_key(name.as_ref()).ok_or_else(|| name.as_ref().to_string()))
        .collect()
}

fn parse_single_char(upper: &str) -> Option<Key> {
    let mut chars = upper.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }

    // Letters and digits use the raw kernel names, e.g. KEY_A and KEY_7
    if c.is_ascii_alphanumeric() {
        return Key::from_str(&format!("KEY_{}", c)).ok();
    }
    None
}

fn parse_function_key(upper: &str) -> Option<Key> {
    let n: u8 = upper.strip_prefix('F')?.parse().ok()?;
    if (1..=24).contains(&n) {
        Key::from_str(&format!("KEY_F{}", n)).ok()
    } else {
        None
    }
}

fn parse_raw_code(upper: &str) -> Option<Key> {
    if upper.starts_with("KEY_") || upper.starts_with("BTN_") {
        match Key::from_str(upper) {
            Ok(key) => return Some(key),
            Err(_) => {
                tracing::warn!("Unknown evdev key: {}", upper);
                return None;
            }
        }
    }
    None
}
