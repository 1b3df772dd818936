//! Push-to-talk core: state machine, controller, cancellation and the
//! blocking session adapter.
//!
//! # Flow
//!
//! ```text
//! KeySource thread ─▶ KeyboardHandler ─▶ EventSender ─┐
//!                                                     ▼
//!                          PttController dispatch loop (ptt-dispatch thread)
//!                                │        │
//!                  PttStateMachine   AsyncAudioRecorder
//!                                │
//!                        ObserverSet ─▶ RecordingSession ─▶ record_with_ptt caller
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ptt_voice::audio::CpalInput;
//! use ptt_voice::config::PttConfig;
//! use ptt_voice::hotkey::RdevKeySource;
//! use ptt_voice::ptt::PushToTalk;
//!
//! let ptt = PushToTalk::new(
//!     PttConfig::default(),
//!     Arc::new(RdevKeySource::new()),
//!     Arc::new(CpalInput::new()),
//! );
//! let (samples, speech) = ptt
//!     .record_with_ptt(Duration::from_secs(60), false, Duration::from_millis(500), 2)
//!     .unwrap();
//! println!("{} samples, speech: {speech}", samples.len());
//! ```

pub mod cancel;
pub mod controller;
pub mod error;
pub mod event;
pub mod observer;
pub mod retry;
pub mod session;
pub mod state;

pub use cancel::{CallbackId, CancellationToken};
pub use controller::{ControllerOptions, PttController, PttStatus};
pub use error::{microphone_remediation, Operation, PttError};
pub use event::{event_channel, EventReceiver, EventSender, PttEvent, PttEventKind, Trigger};
pub use observer::{CapturedAudio, LoggingObserver, ObserverSet, RecordingObserver};
pub use retry::{retry_with_remediation, retry_with_remediation_async, RetryPolicy};
pub use session::{
    record_fixed_duration, record_with_fallback, PushToTalk, RecordingSession,
    DEFAULT_COMPLETION_GRACE,
};
pub use state::{InvalidTransition, PttState, PttStateMachine, StateChangeCallback, TransitionRecord};
