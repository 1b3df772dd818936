//! Microphone input via `cpal`.
//!
//! [`InputBackend`] opens an input stream that delivers [`AudioChunk`]s to a
//! sink closure on the backend's own thread.  [`CpalInput`] is the production
//! backend.  `cpal::Stream` is not `Send` on every platform, so the stream is
//! created, played and dropped on a dedicated `audio-capture` thread; the
//! returned [`InputStream`] handle only talks to that thread.

use std::sync::mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;

// ---------------------------------------------------------------------------
// AudioChunk
// ---------------------------------------------------------------------------

/// A single buffer of mono audio as delivered by the input callback.
///
/// Samples are `f32` in the range `[-1.0, 1.0]`, already downmixed from the
/// device's native channel layout.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono PCM samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Sample rate of this chunk in Hz (e.g. 44100, 48000, 16000).
    pub sample_rate: u32,
}

/// Receives chunks on the backend's capture thread.
pub type FrameSink = Box<dyn FnMut(AudioChunk) + Send>;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while setting up or running the audio capture.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("input device {0:?} not found")]
    DeviceNotFound(String),

    #[error("failed to query default input config: {0}")]
    DefaultConfig(String),

    #[error("failed to build input stream: {0}")]
    BuildStream(String),

    #[error("failed to start audio stream: {0}")]
    PlayStream(String),

    #[error("audio capture thread failed: {0}")]
    Thread(String),
}

impl From<cpal::DefaultStreamConfigError> for CaptureError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        CaptureError::DefaultConfig(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(e: cpal::BuildStreamError) -> Self {
        CaptureError::BuildStream(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for CaptureError {
    fn from(e: cpal::PlayStreamError) -> Self {
        CaptureError::PlayStream(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Something that can open a microphone stream.
pub trait InputBackend: Send + Sync {
    /// Open and start a stream that feeds `sink` until stopped.
    fn open(&self, sink: FrameSink) -> Result<Box<dyn InputStream>, CaptureError>;
}

/// An open input stream.
pub trait InputStream: Send {
    /// Stop and close the stream.  No chunk is delivered after this returns.
    fn stop(self: Box<Self>);
}

// ---------------------------------------------------------------------------
// CpalInput
// ---------------------------------------------------------------------------

/// Production backend using the default `cpal` host.
///
/// `device_name = None` selects the system default input device.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    match name {
        None => host.default_input_device().ok_or(CaptureError::NoDevice),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| CaptureError::DefaultConfig(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceNotFound(wanted.to_string())),
    }
}

/// Build and play the stream; runs on the capture thread.
fn build_stream(device_name: Option<&str>, mut sink: FrameSink) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = select_device(&host, device_name)?;

    let supported = device.default_input_config()?;
    let channels = supported.channels();
    let sample_rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.into();

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            sink(AudioChunk {
                samples: stereo_to_mono(data, channels),
                sample_rate,
            });
        },
        |err: cpal::StreamError| {
            log::error!("cpal stream error: {err}");
        },
        None, // no timeout
    )?;

    stream.play()?;
    log::info!("audio: capture started ({sample_rate} Hz, {channels} ch)");
    Ok(stream)
}

impl InputBackend for CpalInput {
    fn open(&self, sink: FrameSink) -> Result<Box<dyn InputStream>, CaptureError> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match build_stream(device_name.as_deref(), sink) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until asked to stop (or the handle is dropped).
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::Thread(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                stop_tx,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(CaptureError::Thread(
                "capture thread exited before reporting readiness".into(),
            )),
        }
    }
}

struct CpalStream {
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl InputStream for CpalStream {
    fn stop(mut self: Box<Self>) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("audio: capture thread panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// stereo_to_mono
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging all channels.
///
/// The output length is `samples.len() / channels`.
///
/// * If `channels == 1` the input is copied unchanged.
/// * If `channels == 0` an empty vector is returned.
///
/// # Example
///
/// ```rust
/// use ptt_voice::audio::stereo_to_mono;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, 0.4]; // L R L R
/// let mono = stereo_to_mono(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[0] - 0.0).abs() < 1e-6);
/// assert!((mono[1] - 0.3).abs() < 1e-6);
/// ```
pub fn stereo_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// MockInput (test double)
// ---------------------------------------------------------------------------

/// Synthetic input: a thread emits a constant-amplitude chunk every
/// `chunk` interval at 16 kHz until the stream is stopped.
#[cfg(test)]
pub struct MockInput {
    amplitude: std::sync::Arc<std::sync::Mutex<f32>>,
    chunk: std::time::Duration,
    failures_left: std::sync::atomic::AtomicU32,
    opens: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl MockInput {
    pub const SAMPLE_RATE: u32 = 16_000;

    pub fn new(amplitude: f32) -> std::sync::Arc<Self> {
        Self::failing(amplitude, 0)
    }

    /// An input whose first `failures` opens fail with `NoDevice`.
    pub fn failing(amplitude: f32, failures: u32) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            amplitude: std::sync::Arc::new(std::sync::Mutex::new(amplitude)),
            chunk: std::time::Duration::from_millis(10),
            failures_left: std::sync::atomic::AtomicU32::new(failures),
            opens: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Change the amplitude of subsequent chunks (e.g. fall silent).
    pub fn set_amplitude(&self, amplitude: f32) {
        *self.amplitude.lock().unwrap() = amplitude;
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl InputBackend for MockInput {
    fn open(&self, mut sink: FrameSink) -> Result<Box<dyn InputStream>, CaptureError> {
        use std::sync::atomic::Ordering;

        self.opens.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(CaptureError::NoDevice);
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let amplitude = std::sync::Arc::clone(&self.amplitude);
        let chunk = self.chunk;
        let per_chunk = (Self::SAMPLE_RATE as f64 * chunk.as_secs_f64()) as usize;

        let thread = std::thread::spawn(move || {
            let started = std::time::Instant::now();
            let mut emitted = 0u32;
            loop {
                // Pace by wall clock so the captured length tracks elapsed time.
                let next = started + chunk * (emitted + 1);
                let wait = next.saturating_duration_since(std::time::Instant::now());
                match stop_rx.recv_timeout(wait) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let level = *amplitude.lock().unwrap();
                sink(AudioChunk {
                    samples: vec![level; per_chunk],
                    sample_rate: Self::SAMPLE_RATE,
                });
                emitted += 1;
            }
        });

        Ok(Box::new(CpalStream {
            stop_tx,
            thread: Some(thread),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
