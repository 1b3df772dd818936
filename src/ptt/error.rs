//! Error taxonomy for the push-to-talk subsystem.
//!
//! | Class | Variants | Retried |
//! |-------|----------|---------|
//! | configuration | [`PttError::Configuration`] | never |
//! | permission | [`PttError::Permission`] | within the retry budget |
//! | misuse | [`PttError::InvalidTransition`], [`PttError::Misuse`] | never |
//! | transient | [`PttError::Transient`], most [`PttError::Hotkey`] / [`PttError::Audio`] | yes |
//! | fatal | [`PttError::RetriesExhausted`], [`PttError::Internal`] | never |
//!
//! A recording that simply times out is not an error: the caller gets an
//! empty result instead.

use std::fmt;

use thiserror::Error;

use super::state::InvalidTransition;
use crate::audio::CaptureError;
use crate::hotkey::HotkeyError;

/// The two initialisation steps that go through the retry combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    KeyboardInit,
    AudioStart,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::KeyboardInit => write!(f, "keyboard init"),
            Operation::AudioStart => write!(f, "audio start"),
        }
    }
}

/// Everything that can go wrong between a key press and a finished recording.
#[derive(Debug, Clone, Error)]
pub enum PttError {
    /// Invalid mode, key name or numeric setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The OS denied access to the keyboard hook or the microphone.
    #[error("{subsystem} access denied: {message}. {remediation}")]
    Permission {
        subsystem: &'static str,
        message: String,
        remediation: &'static str,
    },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// API used in a way its contract forbids (e.g. controller reuse).
    #[error("misuse: {0}")]
    Misuse(String),

    /// A backend hiccup that is worth another attempt.
    #[error("{operation} failed: {message}")]
    Transient { operation: Operation, message: String },

    #[error("keyboard: {0}")]
    Hotkey(HotkeyError),

    #[error("audio: {0}")]
    Audio(CaptureError),

    /// The retry budget for `operation` is spent.
    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        operation: Operation,
        attempts: u32,
        last: Box<PttError>,
    },

    /// Runtime or thread failure inside the controller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PttError {
    /// Whether the retry combinator should make another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            PttError::Permission { .. } | PttError::Transient { .. } | PttError::Audio(_) => true,
            PttError::Hotkey(e) => !e.is_configuration(),
            PttError::Configuration(_)
            | PttError::InvalidTransition(_)
            | PttError::Misuse(_)
            | PttError::RetriesExhausted { .. }
            | PttError::Internal(_) => false,
        }
    }

    /// `true` for configuration and permission problems the user must fix.
    pub fn needs_user_action(&self) -> bool {
        match self {
            PttError::Configuration(_) | PttError::Permission { .. } => true,
            PttError::RetriesExhausted { last, .. } => last.needs_user_action(),
            _ => false,
        }
    }
}

impl From<HotkeyError> for PttError {
    fn from(e: HotkeyError) -> Self {
        match e {
            HotkeyError::UnknownKey(_) | HotkeyError::EmptyCombo => {
                PttError::Configuration(e.to_string())
            }
            HotkeyError::PermissionDenied {
                reason,
                remediation,
            } => PttError::Permission {
                subsystem: "keyboard",
                message: reason,
                remediation,
            },
            HotkeyError::Spawn(_) => PttError::Hotkey(e),
        }
    }
}

impl From<CaptureError> for PttError {
    fn from(e: CaptureError) -> Self {
        let denied = match &e {
            CaptureError::BuildStream(msg) | CaptureError::PlayStream(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("permission") || msg.contains("denied")
            }
            _ => false,
        };
        if denied {
            return PttError::Permission {
                subsystem: "microphone",
                message: e.to_string(),
                remediation: microphone_remediation(),
            };
        }
        PttError::Audio(e)
    }
}

/// Platform-specific hint shown when the microphone cannot be opened; the
/// keyboard counterpart is [`crate::hotkey::permission_remediation`].
pub fn microphone_remediation() -> &'static str {
    if cfg!(target_os = "macos") {
        "Grant microphone access in System Settings > Privacy & Security > Microphone."
    } else if cfg!(target_os = "linux") {
        "Make sure your user may open audio devices (e.g. member of the 'audio' group) \
         and that PulseAudio/PipeWire is running."
    } else if cfg!(target_os = "windows") {
        "Allow desktop apps to use the microphone in Settings > Privacy > Microphone."
    } else {
        "Check the operating system's microphone permissions."
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
