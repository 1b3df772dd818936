//! Global key-combination handling for push-to-talk, backed by `rdev`.
//!
//! # Design
//!
//! `rdev::listen()` is a blocking OS-level call that never returns while the
//! process is alive.  It must run on a **dedicated OS thread**.  The
//! [`KeySource`] trait hides that thread: a source delivers raw
//! [`KeyEvent`]s to whatever sink is currently installed, and
//! [`KeyboardHandler`] turns those raw presses and releases into
//! combination-level callbacks (`on_press`, `on_release`, `on_cancel`).
//!
//! ```text
//! rdev thread ──KeyEvent──▶ KeyboardHandler (ComboTracker)
//!                                 │
//!                                 ├─ combo complete  → on_press(key)
//!                                 ├─ combo broken    → on_release(key)
//!                                 ├─ cancel key      → on_cancel(key)
//!                                 └─ listener failed → on_error(err)
//! ```
//!
//! Callbacks run synchronously on the listener thread and must not block.

pub mod handler;
pub mod listener;

pub use handler::{ComboSignal, ComboTracker, KeyCallbacks, KeyboardHandler};
pub use listener::{KeySink, KeySource, KeyStream, RdevKeySource};

#[cfg(test)]
pub use listener::MockKeySource;

use std::fmt;

use thiserror::Error;

// ---------------------------------------------------------------------------
// KeyEvent
// ---------------------------------------------------------------------------

/// Raw events delivered by a [`KeySource`].
#[derive(Debug, Clone)]
pub enum KeyEvent {
    /// A key went down (auto-repeat included).
    Press(rdev::Key),
    /// A key went up.
    Release(rdev::Key),
    /// The OS listener died after it was started.
    Failed(HotkeyError),
}

// ---------------------------------------------------------------------------
// HotkeyError
// ---------------------------------------------------------------------------

/// Errors raised while parsing key names or running the global listener.
#[derive(Debug, Clone, Error)]
pub enum HotkeyError {
    /// A key name in the configuration is not recognised.
    #[error("unknown key name {0:?}")]
    UnknownKey(String),

    /// The key combination string contained no keys.
    #[error("key combination is empty")]
    EmptyCombo,

    /// The OS refused to deliver global key events.
    #[error("global key listener unavailable: {reason}. {remediation}")]
    PermissionDenied {
        reason: String,
        remediation: &'static str,
    },

    /// The listener thread could not be created.
    #[error("failed to spawn key listener thread: {0}")]
    Spawn(String),
}

impl HotkeyError {
    /// `true` for errors caused by bad configuration rather than the OS.
    pub fn is_configuration(&self) -> bool {
        matches!(self, HotkeyError::UnknownKey(_) | HotkeyError::EmptyCombo)
    }
}

/// Platform-specific hint shown when the global listener cannot start.
pub fn permission_remediation() -> &'static str {
    if cfg!(target_os = "macos") {
        "Grant access in System Settings > Privacy & Security > Accessibility \
         (and Input Monitoring), then restart the application."
    } else if cfg!(target_os = "linux") {
        "Make sure an X11 session is running (DISPLAY is set) and that your \
         user may read input devices (e.g. member of the 'input' group)."
    } else if cfg!(target_os = "windows") {
        "Run the application in the interactive desktop session; global hooks \
         are blocked for elevated windows unless the app is elevated too."
    } else {
        "Global keyboard hooks are not supported on this platform."
    }
}

// ---------------------------------------------------------------------------
// parse_key
// ---------------------------------------------------------------------------

/// Parse a single key name from a config string into an [`rdev::Key`].
///
/// Supports F1–F12, digits, common named keys and ASCII letters; matching is
/// case-insensitive.  Modifier aliases that stand for both sides of the
/// keyboard (`ctrl`, `shift`, …) are handled by [`KeyCombo::parse`], here
/// they resolve to the left-hand key.
///
/// Returns `None` for unrecognised names.
///
/// # Examples
///
/// ```
/// use ptt_voice::hotkey::parse_key;
///
/// assert_eq!(parse_key("F9"),      Some(rdev::Key::F9));
/// assert_eq!(parse_key("escape"),  Some(rdev::Key::Escape));
/// assert_eq!(parse_key("a"),       Some(rdev::Key::KeyA));
/// assert_eq!(parse_key("xyz"),     None);
/// ```
pub fn parse_key(key_str: &str) -> Option<rdev::Key> {
    use rdev::Key;

    let upper = key_str.trim().to_ascii_uppercase();
    let key = match upper.as_str() {
        // Function keys
        "F1" => Key::F1,
        "F2" => Key::F2,
        "F3" => Key::F3,
        "F4" => Key::F4,
        "F5" => Key::F5,
        "F6" => Key::F6,
        "F7" => Key::F7,
        "F8" => Key::F8,
        "F9" => Key::F9,
        "F10" => Key::F10,
        "F11" => Key::F11,
        "F12" => Key::F12,

        // Modifiers (single side)
        "CTRL" | "CONTROL" | "LCTRL" | "LEFTCTRL" | "CONTROLLEFT" => Key::ControlLeft,
        "RCTRL" | "RIGHTCTRL" | "CONTROLRIGHT" => Key::ControlRight,
        "SHIFT" | "LSHIFT" | "LEFTSHIFT" | "SHIFTLEFT" => Key::ShiftLeft,
        "RSHIFT" | "RIGHTSHIFT" | "SHIFTRIGHT" => Key::ShiftRight,
        "ALT" | "OPTION" | "OPT" | "LALT" | "LEFTALT" => Key::Alt,
        "ALTGR" | "RALT" | "RIGHTALT" => Key::AltGr,
        "CMD" | "COMMAND" | "META" | "SUPER" | "WIN" | "LMETA" | "METALEFT" => Key::MetaLeft,
        "RMETA" | "RCMD" | "METARIGHT" => Key::MetaRight,
        "FN" | "FUNCTION" => Key::Function,

        // Navigation / control
        "ESCAPE" | "ESC" => Key::Escape,
        "SPACE" => Key::Space,
        "RETURN" | "ENTER" => Key::Return,
        "TAB" => Key::Tab,
        "BACKSPACE" => Key::Backspace,
        "DELETE" | "DEL" => Key::Delete,
        "INSERT" | "INS" => Key::Insert,
        "HOME" => Key::Home,
        "END" => Key::End,
        "PAGEUP" => Key::PageUp,
        "PAGEDOWN" => Key::PageDown,
        "UPARROW" | "UP" => Key::UpArrow,
        "DOWNARROW" | "DOWN" => Key::DownArrow,
        "LEFTARROW" | "LEFT" => Key::LeftArrow,
        "RIGHTARROW" | "RIGHT" => Key::RightArrow,

        // Lock / special
        "CAPSLOCK" => Key::CapsLock,
        "NUMLOCK" => Key::NumLock,
        "SCROLLLOCK" => Key::ScrollLock,
        "PRINTSCREEN" => Key::PrintScreen,
        "PAUSE" => Key::Pause,

        // Digits
        "0" => Key::Num0,
        "1" => Key::Num1,
        "2" => Key::Num2,
        "3" => Key::Num3,
        "4" => Key::Num4,
        "5" => Key::Num5,
        "6" => Key::Num6,
        "7" => Key::Num7,
        "8" => Key::Num8,
        "9" => Key::Num9,

        // Letters
        "A" => Key::KeyA,
        "B" => Key::KeyB,
        "C" => Key::KeyC,
        "D" => Key::KeyD,
        "E" => Key::KeyE,
        "F" => Key::KeyF,
        "G" => Key::KeyG,
        "H" => Key::KeyH,
        "I" => Key::KeyI,
        "J" => Key::KeyJ,
        "K" => Key::KeyK,
        "L" => Key::KeyL,
        "M" => Key::KeyM,
        "N" => Key::KeyN,
        "O" => Key::KeyO,
        "P" => Key::KeyP,
        "Q" => Key::KeyQ,
        "R" => Key::KeyR,
        "S" => Key::KeyS,
        "T" => Key::KeyT,
        "U" => Key::KeyU,
        "V" => Key::KeyV,
        "W" => Key::KeyW,
        "X" => Key::KeyX,
        "Y" => Key::KeyY,
        "Z" => Key::KeyZ,

        _ => return None,
    };
    Some(key)
}

/// Both physical keys for a generic modifier name, or `None` if the name is
/// not a two-sided modifier.
fn modifier_pair(token: &str) -> Option<[rdev::Key; 2]> {
    use rdev::Key;

    match token.trim().to_ascii_uppercase().as_str() {
        "CTRL" | "CONTROL" => Some([Key::ControlLeft, Key::ControlRight]),
        "SHIFT" => Some([Key::ShiftLeft, Key::ShiftRight]),
        "ALT" | "OPTION" | "OPT" => Some([Key::Alt, Key::AltGr]),
        "CMD" | "COMMAND" | "META" | "SUPER" | "WIN" => Some([Key::MetaLeft, Key::MetaRight]),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// KeyCombo
// ---------------------------------------------------------------------------

/// A parsed key combination such as `ctrl+shift+space`.
///
/// Each member is a set of acceptable physical keys, so `ctrl` is satisfied
/// by either control key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCombo {
    members: Vec<Vec<rdev::Key>>,
    label: String,
}

impl KeyCombo {
    /// Parse a `+`-separated combination.
    ///
    /// # Errors
    ///
    /// [`HotkeyError::EmptyCombo`] for an empty string and
    /// [`HotkeyError::UnknownKey`] for any unrecognised member.
    pub fn parse(combo: &str) -> Result<Self, HotkeyError> {
        let mut members = Vec::new();
        let mut names = Vec::new();

        for token in combo.split('+').map(str::trim) {
            if token.is_empty() {
                continue;
            }
            let member = match modifier_pair(token) {
                Some(pair) => pair.to_vec(),
                None => vec![parse_key(token).ok_or_else(|| HotkeyError::UnknownKey(token.into()))?],
            };
            members.push(member);
            names.push(token.to_ascii_lowercase());
        }

        if members.is_empty() {
            return Err(HotkeyError::EmptyCombo);
        }

        Ok(Self {
            members,
            label: names.join("+"),
        })
    }

    /// `true` when every member has at least one of its keys in `pressed`.
    pub fn is_satisfied(&self, pressed: &[rdev::Key]) -> bool {
        self.members
            .iter()
            .all(|alternatives| alternatives.iter().any(|k| pressed.contains(k)))
    }

    /// `true` when `key` belongs to any member of the combination.
    pub fn contains(&self, key: rdev::Key) -> bool {
        self.members.iter().any(|alternatives| alternatives.contains(&key))
    }

    /// Number of members (keys that must be held together).
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rdev::Key;

    #[test]
    fn parse_function_and_named_keys() {
        assert_eq!(parse_key("F9"), Some(Key::F9));
        assert_eq!(parse_key("f12"), Some(Key::F12));
        assert_eq!(parse_key("Esc"), Some(Key::Escape));
        assert_eq!(parse_key("enter"), Some(Key::Return));
        assert_eq!(parse_key("7"), Some(Key::Num7));
    }

    #[test]
    fn parse_letter_keys_case_insensitive() {
        assert_eq!(parse_key("A"), Some(Key::KeyA));
        assert_eq!(parse_key("z"), Some(Key::KeyZ));
    }

    #[test]
    fn parse_unknown_key_returns_none() {
        assert_eq!(parse_key("xyz"), None);
        assert_eq!(parse_key(""), None);
        assert_eq!(parse_key("Ctrl+V"), None);
    }

    #[test]
    fn combo_accepts_either_side_of_a_modifier() {
        let combo = KeyCombo::parse("Ctrl + Space").unwrap();
        assert_eq!(combo.len(), 2);
        assert_eq!(combo.to_string(), "ctrl+space");

        assert!(combo.is_satisfied(&[Key::ControlLeft, Key::Space]));
        assert!(combo.is_satisfied(&[Key::Space, Key::ControlRight]));
        assert!(!combo.is_satisfied(&[Key::Space]));
        assert!(!combo.is_satisfied(&[Key::ControlLeft]));
        assert!(combo.contains(Key::ControlRight));
        assert!(!combo.contains(Key::KeyA));
    }

    #[test]
    fn combo_single_key() {
        let combo = KeyCombo::parse("F9").unwrap();
        assert!(combo.is_satisfied(&[Key::F9]));
        assert!(combo.is_satisfied(&[Key::F9, Key::KeyQ]));
    }

    #[test]
    fn combo_rejects_empty_and_unknown() {
        assert!(matches!(KeyCombo::parse(""), Err(HotkeyError::EmptyCombo)));
        assert!(matches!(KeyCombo::parse(" + "), Err(HotkeyError::EmptyCombo)));
        match KeyCombo::parse("ctrl+banana") {
            Err(HotkeyError::UnknownKey(name)) => assert_eq!(name, "banana"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn configuration_errors_are_classified() {
        assert!(HotkeyError::EmptyCombo.is_configuration());
        assert!(HotkeyError::UnknownKey("x".into()).is_configuration());
        assert!(!HotkeyError::Spawn("boom".into()).is_configuration());
    }
}
