//! Audio side of push-to-talk: microphone capture → buffered recorder → VAD.
//!
//! # Pipeline
//!
//! ```text
//! Microphone → cpal callback (audio-capture thread) → stereo_to_mono
//!           → AudioChunk → AudioRecorder frame list ─┬─ stop()   → Vec<f32>
//!                               │                     └─ cancel() → discarded
//!                               └─ VadDetector::is_voice → silence clock
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ptt_voice::audio::{AudioRecorder, CpalInput, VadDetector};
//!
//! let mut recorder = AudioRecorder::new(Arc::new(CpalInput::new()), VadDetector::default());
//! recorder.start().unwrap();
//! std::thread::sleep(std::time::Duration::from_secs(2));
//! let samples = recorder.stop().unwrap_or_default();
//! println!("captured {} samples @ {:?} Hz", samples.len(), recorder.sample_rate());
//! ```

pub mod capture;
pub mod recorder;
pub mod vad;

pub use capture::{
    stereo_to_mono, AudioChunk, CaptureError, CpalInput, FrameSink, InputBackend, InputStream,
};
pub use recorder::{AsyncAudioRecorder, AudioRecorder, RecorderMonitor};
pub use vad::VadDetector;

#[cfg(test)]
pub use capture::MockInput;
