//! Buffered recorder on top of an [`InputBackend`].
//!
//! [`AudioRecorder`] owns at most one open input stream.  The backend's
//! capture thread appends each delivered chunk to an ordered frame list;
//! [`AudioRecorder::stop`] concatenates them into one contiguous sample
//! vector.  All three lifecycle calls block (opening a device can take a
//! while), so async callers go through [`AsyncAudioRecorder`], which runs them
//! on `tokio::task::spawn_blocking`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::capture::{AudioChunk, CaptureError, FrameSink, InputBackend, InputStream};
use super::vad::VadDetector;

// ---------------------------------------------------------------------------
// Shared capture state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CaptureState {
    frames: Vec<Vec<f32>>,
    sample_rate: Option<u32>,
    started_at: Option<Instant>,
    /// Wall-clock time of the most recent voiced chunk.
    last_voice_at: Option<Instant>,
}

fn lock(state: &Mutex<CaptureState>) -> MutexGuard<'_, CaptureState> {
    // A panic inside the capture callback must not take the recorder down.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap, cloneable read access to a recorder's live timing.
///
/// Reads never contend with the (possibly slow) stream open/close calls,
/// which only hold the recorder itself.
#[derive(Clone)]
pub struct RecorderMonitor {
    state: Arc<Mutex<CaptureState>>,
}

impl RecorderMonitor {
    /// Wall-clock time since `start()`; zero when idle.
    pub fn duration(&self) -> Duration {
        lock(&self.state)
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Time since the last voiced chunk, or `None` if nothing voiced has
    /// been heard in the current recording.
    pub fn silence_elapsed(&self) -> Option<Duration> {
        lock(&self.state).last_voice_at.map(|t| t.elapsed())
    }

    /// Sample rate of the current (or last) recording, once known.
    pub fn sample_rate(&self) -> Option<u32> {
        lock(&self.state).sample_rate
    }
}

// ---------------------------------------------------------------------------
// AudioRecorder
// ---------------------------------------------------------------------------

/// Blocking microphone recorder.
pub struct AudioRecorder {
    backend: Arc<dyn InputBackend>,
    vad: VadDetector,
    stream: Option<Box<dyn InputStream>>,
    state: Arc<Mutex<CaptureState>>,
}

impl AudioRecorder {
    /// `vad` classifies chunks for [`RecorderMonitor::silence_elapsed`].
    pub fn new(backend: Arc<dyn InputBackend>, vad: VadDetector) -> Self {
        Self {
            backend,
            vad,
            stream: None,
            state: Arc::new(Mutex::new(CaptureState::default())),
        }
    }

    /// Open the input stream and start buffering.
    ///
    /// Returns `Ok(false)` without opening a second stream when already
    /// recording.
    ///
    /// # Errors
    ///
    /// Whatever the backend reports when the device is unavailable.
    pub fn start(&mut self) -> Result<bool, CaptureError> {
        if self.stream.is_some() {
            log::warn!("audio: start requested while already recording");
            return Ok(false);
        }

        {
            let mut state = lock(&self.state);
            *state = CaptureState::default();
        }

        let state = Arc::clone(&self.state);
        let vad = self.vad;
        let sink: FrameSink = Box::new(move |chunk: AudioChunk| {
            let voiced = vad.is_voice(&chunk.samples);
            let mut state = lock(&state);
            state.sample_rate.get_or_insert(chunk.sample_rate);
            if voiced {
                state.last_voice_at = Some(Instant::now());
            }
            state.frames.push(chunk.samples);
        });

        let stream = self.backend.open(sink)?;
        lock(&self.state).started_at = Some(Instant::now());
        self.stream = Some(stream);
        log::debug!("audio: recording started");
        Ok(true)
    }

    /// Close the stream and return everything captured since `start()`.
    ///
    /// The result is empty (not `None`) when no chunk arrived.  Returns
    /// `None` when not recording.
    pub fn stop(&mut self) -> Option<Vec<f32>> {
        let stream = self.stream.take()?;
        stream.stop();

        let mut state = lock(&self.state);
        let frames = std::mem::take(&mut state.frames);
        state.started_at = None;
        state.last_voice_at = None;
        drop(state);

        let total = frames.iter().map(Vec::len).sum();
        let mut samples = Vec::with_capacity(total);
        for frame in frames {
            samples.extend_from_slice(&frame);
        }
        log::debug!("audio: recording stopped ({} samples)", samples.len());
        Some(samples)
    }

    /// Close the stream and discard the buffer.  No-op when not recording.
    pub fn cancel(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        stream.stop();

        let mut state = lock(&self.state);
        state.frames.clear();
        state.started_at = None;
        state.last_voice_at = None;
        log::debug!("audio: recording cancelled");
    }

    pub fn is_recording(&self) -> bool {
        self.stream.is_some()
    }

    /// Wall-clock time since `start()`; zero when idle.
    pub fn duration(&self) -> Duration {
        self.monitor().duration()
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.monitor().sample_rate()
    }

    pub fn monitor(&self) -> RecorderMonitor {
        RecorderMonitor {
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ---------------------------------------------------------------------------
// AsyncAudioRecorder
// ---------------------------------------------------------------------------

/// Async façade over [`AudioRecorder`].
///
/// Every lifecycle call is moved onto tokio's blocking pool so an awaiting
/// task never stalls the event loop.  Cheap to clone.
#[derive(Clone)]
pub struct AsyncAudioRecorder {
    inner: Arc<Mutex<AudioRecorder>>,
    monitor: RecorderMonitor,
}

impl AsyncAudioRecorder {
    pub fn new(recorder: AudioRecorder) -> Self {
        let monitor = recorder.monitor();
        Self {
            inner: Arc::new(Mutex::new(recorder)),
            monitor,
        }
    }

    fn with_recorder<T>(inner: &Mutex<AudioRecorder>, f: impl FnOnce(&mut AudioRecorder) -> T) -> T {
        let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// See [`AudioRecorder::start`].
    pub async fn start(&self) -> Result<bool, CaptureError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || Self::with_recorder(&inner, |r| r.start()))
            .await
            .map_err(|e| CaptureError::Thread(format!("start task failed: {e}")))?
    }

    /// See [`AudioRecorder::stop`].
    pub async fn stop(&self) -> Option<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        match tokio::task::spawn_blocking(move || Self::with_recorder(&inner, |r| r.stop())).await {
            Ok(samples) => samples,
            Err(e) => {
                log::error!("audio: stop task failed: {e}");
                None
            }
        }
    }

    /// See [`AudioRecorder::cancel`].
    pub async fn cancel(&self) {
        let inner = Arc::clone(&self.inner);
        if let Err(e) =
            tokio::task::spawn_blocking(move || Self::with_recorder(&inner, |r| r.cancel())).await
        {
            log::error!("audio: cancel task failed: {e}");
        }
    }

    /// Blocking cancel for callers outside the runtime (teardown paths).
    pub fn cancel_blocking(&self) {
        Self::with_recorder(&self.inner, |r| r.cancel());
    }

    pub fn is_recording(&self) -> bool {
        Self::with_recorder(&self.inner, |r| r.is_recording())
    }

    /// Wall-clock time since `start()`; zero when idle.
    pub fn duration(&self) -> Duration {
        self.monitor.duration()
    }

    pub fn monitor(&self) -> &RecorderMonitor {
        &self.monitor
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
