//! Blocking entry point: one key-gated recording, one result.
//!
//! [`PushToTalk::record_with_ptt`] builds a fresh [`PttController`], registers
//! a [`RecordingSession`] as one of its observers, enables it and parks the
//! calling thread on the session's completion signal.  It is meant for a
//! blocking-pool thread; async callers use [`PushToTalk::record_async`].
//!
//! ```text
//! caller thread                     ptt-dispatch thread
//! ─────────────                     ───────────────────
//! enable() ───────────────────────▶ process_events()
//! wait_for_completion(max + grace)        │ on_recording_stop / cancel / error
//!        ◀──────────── notify ─────────────┘
//! take_result()
//! drop(guard) → disable()
//! ```

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::cancel::CancellationToken;
use super::controller::{ControllerOptions, PttController, PttStatus};
use super::observer::{CapturedAudio, ObserverSet, RecordingObserver};
use super::PttError;
use crate::audio::{AudioRecorder, InputBackend, VadDetector};
use crate::config::{PttConfig, PttMode};
use crate::hotkey::KeySource;

/// Extra wait beyond `max_duration` before the caller gives up.
pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_secs(30);

/// Poll granularity of [`record_fixed_duration`].
const FIXED_CHUNK: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// RecordingSession
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionData {
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    audio_data: Option<Vec<f32>>,
    speech_detected: bool,
    cancelled: bool,
    error: Option<PttError>,
    completed: bool,
}

/// Outcome holder for one blocking recording round trip.
///
/// The first of stop / cancel / error completes the session; later
/// notifications are ignored.
#[derive(Default)]
pub struct RecordingSession {
    data: Mutex<SessionData>,
    completed: Condvar,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(&self, outcome: impl FnOnce(&mut SessionData)) {
        let mut data = self.lock();
        if data.completed {
            return;
        }
        outcome(&mut data);
        data.end_time = Some(Instant::now());
        data.completed = true;
        drop(data);
        self.completed.notify_all();
    }

    /// Block the calling thread until the session completes or `timeout`
    /// passes.  Returns whether it completed.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let data = self.lock();
        let (data, _) = self
            .completed
            .wait_timeout_while(data, timeout, |d| !d.completed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        data.completed
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn was_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.lock().start_time
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.lock().end_time
    }

    /// Move the outcome out: samples and speech flag, empty on cancel, or
    /// the captured error.
    ///
    /// # Errors
    ///
    /// The error reported through [`RecordingObserver::on_error`].
    pub fn take_result(&self) -> Result<(Vec<f32>, bool), PttError> {
        let mut data = self.lock();
        if let Some(error) = data.error.take() {
            return Err(error);
        }
        let samples = data.audio_data.take().unwrap_or_default();
        Ok((samples, data.speech_detected && !data.cancelled))
    }
}

impl RecordingObserver for RecordingSession {
    fn on_recording_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    fn on_recording_stop(&self, audio: &CapturedAudio) {
        self.complete(|d| {
            d.audio_data = Some(audio.samples.clone());
            d.speech_detected = audio.speech_detected;
        });
    }

    fn on_recording_cancel(&self) {
        self.complete(|d| d.cancelled = true);
    }

    fn on_error(&self, error: &PttError) {
        let error = error.clone();
        self.complete(|d| d.error = Some(error));
    }
}

// ---------------------------------------------------------------------------
// PushToTalk
// ---------------------------------------------------------------------------

/// Disables the controller on every exit path.  After this runs the
/// controller's own `Drop` has nothing left to tear down.
struct DisableOnDrop(PttController);

impl Drop for DisableOnDrop {
    fn drop(&mut self) {
        self.0.disable();
    }
}

/// Long-lived factory for push-to-talk recordings.
///
/// Key source, input backend, observers and the optional cancellation token
/// are built once at start-up; every call gets a fresh controller.
#[derive(Clone)]
pub struct PushToTalk {
    config: PttConfig,
    key_source: Arc<dyn KeySource>,
    input: Arc<dyn InputBackend>,
    observers: ObserverSet,
    cancel: Option<CancellationToken>,
    grace: Duration,
    last_status: Arc<Mutex<Option<PttStatus>>>,
}

impl PushToTalk {
    pub fn new(config: PttConfig, key_source: Arc<dyn KeySource>, input: Arc<dyn InputBackend>) -> Self {
        let grace = config.completion_grace();
        Self {
            config,
            key_source,
            input,
            observers: ObserverSet::new(),
            cancel: None,
            grace,
            last_status: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RecordingObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn config(&self) -> &PttConfig {
        &self.config
    }

    /// Controller status captured at the end of the most recent recording
    /// (shared between clones).
    pub fn last_status(&self) -> Option<PttStatus> {
        self.last_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remember_status(&self, controller: &PttController) {
        let status = controller.get_status();
        *self
            .last_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(status);
    }

    /// Record one key-gated utterance.
    ///
    /// Blocks for at most `max_duration` plus the grace period.  A timeout
    /// or a cancellation yields `Ok((vec![], false))`.
    ///
    /// # Errors
    ///
    /// Controller construction and `enable()` failures, and any fatal error
    /// reported during the recording (e.g. the microphone could not be
    /// opened within the retry budget).
    pub fn record_with_ptt(
        &self,
        max_duration: Duration,
        disable_silence_detection: bool,
        min_duration: Duration,
        vad_aggressiveness: u8,
    ) -> Result<(Vec<f32>, bool), PttError> {
        let mut mode = self.config.mode;
        if mode == PttMode::Hybrid && disable_silence_detection {
            log::debug!("ptt: silence detection disabled, using hold mode");
            mode = PttMode::Hold;
        }

        let options = ControllerOptions {
            mode,
            max_duration,
            min_duration,
            vad_aggressiveness,
            ..ControllerOptions::from_config(&self.config)
        };

        let session = Arc::new(RecordingSession::new());
        let mut observers = self.observers.clone();
        observers.push(session.clone());

        let mut controller = PttController::new(
            options,
            Arc::clone(&self.key_source),
            Arc::clone(&self.input),
            observers,
        )?;
        if let Some(token) = &self.cancel {
            controller = controller.with_cancellation(token.clone());
        }

        let mut guard = DisableOnDrop(controller);
        if !guard.0.enable()? {
            return Err(PttError::Misuse("fresh controller was already enabled".into()));
        }
        log::info!("ptt: hold {} to talk ({mode} mode)", self.config.key_combo);

        let completed = session.wait_for_completion(max_duration + self.grace);
        self.remember_status(&guard.0);
        if !completed {
            log::warn!(
                "ptt: no recording completed within {:.0}s, giving up",
                (max_duration + self.grace).as_secs_f64()
            );
            return Ok((Vec::new(), false));
        }

        let result = session.take_result();
        drop(guard);
        result
    }

    /// [`record_with_ptt`](Self::record_with_ptt) on tokio's blocking pool.
    ///
    /// # Errors
    ///
    /// As `record_with_ptt`, plus [`PttError::Internal`] if the blocking task
    /// panics.
    pub async fn record_async(
        &self,
        max_duration: Duration,
        disable_silence_detection: bool,
        min_duration: Duration,
        vad_aggressiveness: u8,
    ) -> Result<(Vec<f32>, bool), PttError> {
        let ptt = self.clone();
        tokio::task::spawn_blocking(move || {
            ptt.record_with_ptt(
                max_duration,
                disable_silence_detection,
                min_duration,
                vad_aggressiveness,
            )
        })
        .await
        .map_err(|e| PttError::Internal(format!("recording task failed: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

/// Try push-to-talk, fall back to another recording path on failure.
///
/// The fallback's own error is returned as is.
///
/// # Errors
///
/// Only when `fallback` fails.
pub fn record_with_fallback<P, F>(ptt: P, fallback: F) -> Result<(Vec<f32>, bool), PttError>
where
    P: FnOnce() -> Result<(Vec<f32>, bool), PttError>,
    F: FnOnce() -> Result<(Vec<f32>, bool), PttError>,
{
    match ptt() {
        Ok(result) => Ok(result),
        Err(error) => {
            log::warn!("ptt: push-to-talk failed ({error}), falling back to fixed-duration recording");
            fallback()
        }
    }
}

/// Record for a fixed `duration` without any key gating.
///
/// `cancel` is checked before and after every 100 ms chunk; a cancelled
/// recording returns `Ok((vec![], false))`.
///
/// # Errors
///
/// The microphone could not be opened.
pub fn record_fixed_duration(
    input: Arc<dyn InputBackend>,
    duration: Duration,
    vad: VadDetector,
    cancel: Option<&CancellationToken>,
) -> Result<(Vec<f32>, bool), PttError> {
    let is_cancelled = || cancel.is_some_and(CancellationToken::is_cancelled);
    if is_cancelled() {
        return Ok((Vec::new(), false));
    }

    let mut recorder = AudioRecorder::new(input, vad);
    recorder.start()?;
    log::info!("recording for {:.1}s", duration.as_secs_f64());

    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if is_cancelled() {
            recorder.cancel();
            log::info!("fixed-duration recording cancelled");
            return Ok((Vec::new(), false));
        }
        std::thread::sleep(FIXED_CHUNK.min(deadline - now));
        if is_cancelled() {
            recorder.cancel();
            log::info!("fixed-duration recording cancelled");
            return Ok((Vec::new(), false));
        }
    }

    let samples = recorder.stop().unwrap_or_default();
    let sample_rate = recorder.sample_rate().unwrap_or(0);
    let speech_detected = vad.contains_speech(&samples, sample_rate);
    Ok((samples, speech_detected))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MockInput;
    use crate::hotkey::MockKeySource;
    use rdev::Key;

    fn ptt(mode: PttMode, keys: Arc<MockKeySource>, input: Arc<MockInput>) -> PushToTalk {
        let config = PttConfig {
            mode,
            ..PttConfig::default()
        };
        PushToTalk::new(config, keys, input)
    }

    /// Run `script` once the controller is listening.
    fn drive(keys: &Arc<MockKeySource>, script: impl FnOnce(&MockKeySource) + Send + 'static) {
        let keys = Arc::clone(keys);
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !keys.is_listening() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            script(&keys);
        });
    }

    #[test]
    fn completion_is_signalled_once() {
        let session = RecordingSession::new();
        assert!(!session.wait_for_completion(Duration::from_millis(10)));

        session.on_recording_start();
        session.on_recording_stop(&CapturedAudio {
            samples: vec![0.1; 4],
            sample_rate: 16_000,
            duration: Duration::from_millis(1),
            speech_detected: true,
        });
        session.on_recording_cancel();

        assert!(session.wait_for_completion(Duration::from_millis(10)));
        assert!(!session.was_cancelled());
        assert!(session.start_time().unwrap() <= session.end_time().unwrap());
        assert_eq!(session.take_result().unwrap(), (vec![0.1; 4], true));
    }

    #[test]
    fn waiter_on_another_thread_is_woken() {
        let session = Arc::new(RecordingSession::new());
        let s = Arc::clone(&session);
        let waiter = std::thread::spawn(move || s.wait_for_completion(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        session.on_error(&PttError::Internal("boom".into()));
        assert!(waiter.join().unwrap());
        assert!(matches!(session.take_result(), Err(PttError::Internal(_))));
    }

    #[test]
    fn hold_recording_returns_samples_and_speech() {
        let keys = MockKeySource::new();
        let ptt = ptt(PttMode::Hold, keys.clone(), MockInput::new(0.2));
        drive(&keys, |k| {
            k.press(Key::ControlLeft);
            k.press(Key::Space);
            std::thread::sleep(Duration::from_millis(600));
            k.release(Key::Space);
        });

        let (samples, speech) = ptt
            .record_with_ptt(Duration::from_secs(5), false, Duration::from_millis(500), 2)
            .unwrap();
        let secs = samples.len() as f32 / MockInput::SAMPLE_RATE as f32;
        assert!((0.5..0.9).contains(&secs), "captured {secs}s");
        assert!(speech);
        assert_eq!(keys.stop_count(), 1);
        assert!(!keys.is_listening());
    }

    #[test]
    fn timeout_returns_empty_and_tears_down_once() {
        let keys = MockKeySource::new();
        let ptt = ptt(PttMode::Hold, keys.clone(), MockInput::new(0.2))
            .with_grace(Duration::from_millis(200));

        let started = Instant::now();
        let result = ptt
            .record_with_ptt(Duration::from_millis(100), false, Duration::from_millis(50), 2)
            .unwrap();
        assert_eq!(result, (Vec::new(), false));
        assert!(started.elapsed() >= Duration::from_millis(300));
        let status = ptt.last_status().unwrap();
        assert_eq!(status.state, crate::ptt::PttState::WaitingForKey);
        assert!(status.enabled);
        assert_eq!(keys.listen_count(), 1);
        assert_eq!(keys.stop_count(), 1);
        assert!(!keys.is_listening());
    }

    #[test]
    fn cancellation_returns_empty() {
        let keys = MockKeySource::new();
        let token = CancellationToken::new();
        let ptt = ptt(PttMode::Toggle, keys.clone(), MockInput::new(0.2))
            .with_cancellation(token.clone());
        drive(&keys, move |k| {
            k.press(Key::ControlLeft);
            k.tap(Key::Space);
            k.release(Key::ControlLeft);
            std::thread::sleep(Duration::from_millis(200));
            token.cancel("user abort");
        });

        let result = ptt
            .record_with_ptt(Duration::from_secs(5), false, Duration::from_millis(0), 2)
            .unwrap();
        assert_eq!(result, (Vec::new(), false));
        assert_eq!(keys.stop_count(), 1);
    }

    #[test]
    fn audio_failure_surfaces_as_error() {
        let keys = MockKeySource::new();
        let ptt = ptt(PttMode::Hold, keys.clone(), MockInput::failing(0.2, 100));
        drive(&keys, |k| {
            k.press(Key::ControlLeft);
            k.press(Key::Space);
        });

        let err = ptt
            .record_with_ptt(Duration::from_secs(5), false, Duration::from_millis(0), 2)
            .unwrap_err();
        assert!(matches!(err, PttError::RetriesExhausted { .. }));
        assert_eq!(keys.stop_count(), 1);
    }

    #[test]
    fn enable_failure_is_returned_immediately() {
        let keys = MockKeySource::failing(100);
        let ptt = ptt(PttMode::Hold, keys.clone(), MockInput::new(0.2));
        let started = Instant::now();
        let err = ptt
            .record_with_ptt(Duration::from_secs(5), false, Duration::from_millis(0), 2)
            .unwrap_err();
        assert!(matches!(err, PttError::RetriesExhausted { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn hybrid_downgrades_to_hold_without_silence_detection() {
        let keys = MockKeySource::new();
        let input = MockInput::new(0.2);
        let ptt = ptt(PttMode::Hybrid, keys.clone(), input.clone());
        let fall_silent = Arc::clone(&input);
        drive(&keys, move |k| {
            k.press(Key::ControlLeft);
            k.press(Key::Space);
            std::thread::sleep(Duration::from_millis(200));
            fall_silent.set_amplitude(0.0);
            // Hybrid would stop ~1.5 s after this; hold keeps going.
            std::thread::sleep(Duration::from_millis(2_000));
            k.release(Key::Space);
        });

        let (samples, _) = ptt
            .record_with_ptt(Duration::from_secs(5), true, Duration::from_millis(0), 2)
            .unwrap();
        let secs = samples.len() as f32 / MockInput::SAMPLE_RATE as f32;
        assert!(secs > 2.0, "captured {secs}s");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn record_async_runs_on_blocking_pool() {
        let keys = MockKeySource::new();
        let ptt = ptt(PttMode::Hold, keys.clone(), MockInput::new(0.2))
            .with_grace(Duration::from_millis(50));
        let result = ptt
            .record_async(Duration::from_millis(50), false, Duration::from_millis(0), 2)
            .await
            .unwrap();
        assert_eq!(result, (Vec::new(), false));
    }

    #[test]
    fn fallback_runs_only_on_failure() {
        let ok = record_with_fallback(|| Ok((vec![1.0], true)), || panic!("not needed"));
        assert_eq!(ok.unwrap(), (vec![1.0], true));

        let recovered = record_with_fallback(
            || Err(PttError::Internal("ptt down".into())),
            || Ok((vec![0.5], false)),
        );
        assert_eq!(recovered.unwrap(), (vec![0.5], false));

        let failed = record_with_fallback(
            || Err(PttError::Internal("ptt down".into())),
            || Err(PttError::Misuse("fallback down".into())),
        );
        assert!(matches!(failed, Err(PttError::Misuse(_))));
    }

    #[test]
    fn fixed_duration_records_and_honours_cancel() {
        let input = MockInput::new(0.2);
        let (samples, speech) =
            record_fixed_duration(input.clone(), Duration::from_millis(300), VadDetector::default(), None)
                .unwrap();
        let secs = samples.len() as f32 / MockInput::SAMPLE_RATE as f32;
        assert!((0.2..0.5).contains(&secs), "captured {secs}s");
        assert!(speech);

        let token = CancellationToken::new();
        let t = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            t.cancel("stop");
        });
        let started = Instant::now();
        let result =
            record_fixed_duration(input, Duration::from_secs(5), VadDetector::default(), Some(&token))
                .unwrap();
        assert_eq!(result, (Vec::new(), false));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
