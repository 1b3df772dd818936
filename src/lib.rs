//! ptt-voice — push-to-talk voice recording.
//!
//! A key combination gates microphone capture; the caller blocks on a single
//! `(samples, speech_detected)` result.
//!
//! # Modules
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`hotkey`] | global key listener, key-combination tracking |
//! | [`audio`]  | microphone stream, recorder, energy VAD |
//! | [`ptt`]    | state machine, controller, cancellation, session |
//! | [`config`] | settings file and `PTT_*` environment overrides |

pub mod audio;
pub mod config;
pub mod hotkey;
pub mod ptt;
