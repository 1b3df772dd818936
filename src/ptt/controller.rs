//! Push-to-talk controller: key events in, recordings out.
//!
//! # Threads
//!
//! ```text
//! key-listener thread ──on_press/on_release/on_cancel──┐
//! timeout / silence / min-duration tasks ──────────────┤  EventSender (unbounded)
//! CancellationToken callback, PttController::cancel ───┘
//!                                                      ▼
//!                         ptt-dispatch thread: current-thread tokio runtime
//!                           process_events() ── wait_for_event(100 ms) ─┐
//!                              │                                        │
//!                              ├─ StartRecording → AsyncAudioRecorder::start (spawn_blocking)
//!                              ├─ StopRecording  → stop + VAD → observers.on_recording_stop
//!                              ├─ Cancel         → cancel     → observers.on_recording_cancel
//!                              └─ Error          → keyboard recovery / observers.on_error
//! ```
//!
//! Key callbacks only enqueue.  Every state change happens on the dispatch
//! thread, in queue order, so a timeout and a key release racing each other
//! are simply two events and the first one queued wins.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use super::cancel::{CallbackId, CancellationToken};
use super::event::{event_channel, EventReceiver, EventSender, PttEvent, PttEventKind, Trigger};
use super::observer::{CapturedAudio, ObserverSet};
use super::retry::{retry_with_remediation, retry_with_remediation_async, RetryPolicy};
use super::state::{PttState, PttStateMachine, TransitionRecord};
use super::{Operation, PttError};
use crate::audio::{AsyncAudioRecorder, AudioRecorder, InputBackend, VadDetector};
use crate::config::{PttConfig, PttMode};
use crate::hotkey::{parse_key, KeyCallbacks, KeyCombo, KeySource, KeyboardHandler};

/// How long one `wait_for_event` blocks before the loop re-checks shutdown.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sampling period of the hybrid-mode silence watcher.
const SILENCE_POLL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// ControllerOptions
// ---------------------------------------------------------------------------

/// Everything a controller needs to know about one recording attempt.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub mode: PttMode,
    pub key_combo: String,
    pub cancel_key: Option<String>,
    /// Recording is stopped after this long regardless of the keys.
    pub max_duration: Duration,
    /// Hold/hybrid releases before this are deferred.
    pub min_duration: Duration,
    /// Hybrid-mode trailing silence.
    pub silence_threshold: Duration,
    pub vad_aggressiveness: u8,
    pub retry: RetryPolicy,
}

impl ControllerOptions {
    pub fn from_config(config: &PttConfig) -> Self {
        Self {
            mode: config.mode,
            key_combo: config.key_combo.clone(),
            cancel_key: config.cancel_key.clone(),
            max_duration: config.timeout(),
            min_duration: config.min_duration(),
            silence_threshold: config.silence_threshold(),
            vad_aggressiveness: config.vad_aggressiveness,
            retry: RetryPolicy::new(config.max_retries),
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&PttConfig::default())
    }
}

// ---------------------------------------------------------------------------
// PttStatus
// ---------------------------------------------------------------------------

/// Read-only snapshot for logs and status displays.
#[derive(Debug, Clone, Serialize)]
pub struct PttStatus {
    pub enabled: bool,
    pub state: PttState,
    pub is_recording: bool,
    pub mode: PttMode,
    pub key_combo: String,
    pub cancel_key: Option<String>,
    pub timeout_secs: f64,
    pub min_duration_secs: f64,
    pub recording_secs: f64,
    pub error_count: u32,
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

fn lock_keyboard(keyboard: &Mutex<KeyboardHandler>) -> MutexGuard<'_, KeyboardHandler> {
    keyboard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Operation-specific repair between retry attempts.
#[derive(Clone)]
struct Recovery {
    keyboard: Arc<Mutex<KeyboardHandler>>,
    recorder: AsyncAudioRecorder,
}

impl Recovery {
    fn recover_from_error(&self, operation: Operation, error: &PttError) -> bool {
        if !error.is_retryable() {
            return false;
        }
        log::warn!("ptt: recovering from {operation} failure: {error}");
        match operation {
            // Drop the registration so the next start() re-initialises it.
            Operation::KeyboardInit => lock_keyboard(&self.keyboard).stop(),
            // Release whatever half-open stream the failed start left behind.
            Operation::AudioStart => self.recorder.cancel_blocking(),
        }
        true
    }

    fn start_keyboard(&self, policy: RetryPolicy) -> Result<(), PttError> {
        retry_with_remediation(
            Operation::KeyboardInit,
            policy,
            |_| lock_keyboard(&self.keyboard).start().map(|_| ()).map_err(PttError::from),
            |e| self.recover_from_error(Operation::KeyboardInit, e),
        )
    }
}

// ---------------------------------------------------------------------------
// PttController
// ---------------------------------------------------------------------------

struct DispatchHandle {
    shutdown: CancellationToken,
    thread: JoinHandle<()>,
}

/// Owns one state machine, one keyboard registration and one recorder.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ptt_voice::audio::CpalInput;
/// use ptt_voice::hotkey::RdevKeySource;
/// use ptt_voice::ptt::{ControllerOptions, ObserverSet, PttController};
///
/// let mut controller = PttController::new(
///     ControllerOptions::default(),
///     Arc::new(RdevKeySource::new()),
///     Arc::new(CpalInput::new()),
///     ObserverSet::new(),
/// )
/// .unwrap();
/// controller.enable().unwrap();
/// println!("{}", controller.get_state_summary());
/// controller.disable();
/// ```
pub struct PttController {
    options: ControllerOptions,
    machine: Arc<PttStateMachine>,
    keyboard: Arc<Mutex<KeyboardHandler>>,
    recorder: AsyncAudioRecorder,
    observers: ObserverSet,
    external_cancel: Option<CancellationToken>,
    cancel_registration: Option<CallbackId>,
    events: Option<EventSender>,
    dispatch: Option<DispatchHandle>,
    enabled: Arc<AtomicBool>,
    error_count: Arc<AtomicU32>,
}

impl PttController {
    /// Parse the key settings and wire the collaborators together.
    ///
    /// # Errors
    ///
    /// [`PttError::Configuration`] for an unknown key name or an empty
    /// combination.
    pub fn new(
        options: ControllerOptions,
        key_source: Arc<dyn KeySource>,
        input: Arc<dyn InputBackend>,
        observers: ObserverSet,
    ) -> Result<Self, PttError> {
        let combo = KeyCombo::parse(&options.key_combo)?;
        let cancel_key = match options.cancel_key.as_deref() {
            None => None,
            Some(name) => Some(parse_key(name).ok_or_else(|| {
                PttError::Configuration(format!("unknown cancel key {name:?}"))
            })?),
        };

        let vad = VadDetector::from_aggressiveness(options.vad_aggressiveness);
        let recorder = AsyncAudioRecorder::new(AudioRecorder::new(input, vad));

        Ok(Self {
            options,
            machine: Arc::new(PttStateMachine::new()),
            keyboard: Arc::new(Mutex::new(KeyboardHandler::new(key_source, combo, cancel_key))),
            recorder,
            observers,
            external_cancel: None,
            cancel_registration: None,
            events: None,
            dispatch: None,
            enabled: Arc::new(AtomicBool::new(false)),
            error_count: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Cancel the recording whenever `token` is cancelled while enabled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.external_cancel = Some(token);
        self
    }

    fn recovery(&self) -> Recovery {
        Recovery {
            keyboard: Arc::clone(&self.keyboard),
            recorder: self.recorder.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // enable / disable
    // -----------------------------------------------------------------------

    /// Start listening and arm the controller.
    ///
    /// Returns `Ok(false)` when already enabled.
    ///
    /// # Errors
    ///
    /// Keyboard start-up failures after the retry budget, or runtime/thread
    /// creation failures.  Everything started so far is torn down again.
    pub fn enable(&mut self) -> Result<bool, PttError> {
        if self.dispatch.is_some() || self.machine.current() != PttState::Idle {
            return Ok(false);
        }

        let (tx, rx) = event_channel();
        lock_keyboard(&self.keyboard).set_callbacks(key_callbacks(&tx, self.options.mode));

        if let Err(e) = self.recovery().start_keyboard(self.options.retry) {
            lock_keyboard(&self.keyboard).stop();
            return Err(e);
        }

        match self.spawn_dispatch(tx.clone(), rx) {
            Ok(handle) => self.dispatch = Some(handle),
            Err(e) => {
                self.rollback();
                return Err(e);
            }
        }

        if let Some(token) = &self.external_cancel {
            let tx = tx.clone();
            self.cancel_registration = Some(token.on_cancel(move |reason| {
                tx.send(PttEvent::cancel(reason));
            }));
        }
        self.events = Some(tx);

        log::info!(
            "ptt: enabled ({} mode, combo {})",
            self.options.mode,
            self.options.key_combo
        );
        Ok(true)
    }

    fn spawn_dispatch(&self, tx: EventSender, rx: EventReceiver) -> Result<DispatchHandle, PttError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PttError::Internal(format!("failed to build dispatch runtime: {e}")))?;

        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher {
            options: self.options.clone(),
            machine: Arc::clone(&self.machine),
            recorder: self.recorder.clone(),
            recovery: self.recovery(),
            observers: self.observers.clone(),
            events: tx,
            receiver: rx,
            shutdown: shutdown.clone(),
            enabled: Arc::clone(&self.enabled),
            error_count: Arc::clone(&self.error_count),
            vad: VadDetector::from_aggressiveness(self.options.vad_aggressiveness),
            cycle: 0,
            cycle_tasks: Vec::new(),
            stop_deferred: false,
        };

        // Armed before the loop exists; early key events simply queue up.
        self.enabled.store(true, Ordering::SeqCst);
        self.machine.transition(PttState::WaitingForKey, "enable")?;

        let thread = std::thread::Builder::new()
            .name("ptt-dispatch".into())
            .spawn(move || runtime.block_on(dispatcher.process_events()))
            .map_err(|e| PttError::Internal(format!("failed to spawn dispatch thread: {e}")))?;

        Ok(DispatchHandle { shutdown, thread })
    }

    fn rollback(&mut self) {
        self.enabled.store(false, Ordering::SeqCst);
        lock_keyboard(&self.keyboard).stop();
        self.machine.reset();
    }

    /// Stop listening, shut the dispatch loop down and release the
    /// microphone.  Safe to call any number of times.
    ///
    /// Returns whether the controller was enabled.
    pub fn disable(&mut self) -> bool {
        let was_enabled = self.enabled.swap(false, Ordering::SeqCst);

        lock_keyboard(&self.keyboard).stop();

        if let Some(handle) = self.dispatch.take() {
            handle.shutdown.cancel("disable");
            if handle.thread.thread().id() == std::thread::current().id() {
                log::debug!("ptt: disable called from the dispatch thread, not joining");
            } else if handle.thread.join().is_err() {
                log::error!("ptt: dispatch thread panicked");
            }
            // A keyboard recovery in flight may have re-registered the listener.
            lock_keyboard(&self.keyboard).stop();
        }

        if let (Some(token), Some(id)) = (&self.external_cancel, self.cancel_registration.take()) {
            token.remove_callback(id);
        }
        self.events = None;
        self.recorder.cancel_blocking();
        self.machine.reset();

        if was_enabled {
            log::info!("ptt: disabled");
        }
        was_enabled
    }

    // -----------------------------------------------------------------------
    // External requests
    // -----------------------------------------------------------------------

    /// Queue a cancellation.  Returns `false` when not enabled.
    pub fn cancel(&self, reason: &str) -> bool {
        match &self.events {
            Some(tx) => tx.send(PttEvent::cancel(reason)),
            None => false,
        }
    }

    /// Queue a start as if the combination had been pressed.
    pub fn start_recording(&self) -> bool {
        match &self.events {
            Some(tx) => tx.send(PttEvent::start(Trigger::External)),
            None => false,
        }
    }

    /// Queue a stop as if the combination had been released.
    pub fn stop_recording(&self) -> bool {
        match &self.events {
            Some(tx) => tx.send(PttEvent::stop(Trigger::External)),
            None => false,
        }
    }

    /// Apply the remediation for `operation` after `error`; returns whether
    /// another attempt makes sense.
    pub fn recover_from_error(&self, operation: Operation, error: &PttError) -> bool {
        self.recovery().recover_from_error(operation, error)
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    pub fn state(&self) -> PttState {
        self.machine.current()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.machine.is_recording()
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.machine.history()
    }

    pub fn get_status(&self) -> PttStatus {
        let state = self.machine.current();
        PttStatus {
            enabled: self.is_enabled(),
            state,
            is_recording: state == PttState::Recording,
            mode: self.options.mode,
            key_combo: self.options.key_combo.clone(),
            cancel_key: self.options.cancel_key.clone(),
            timeout_secs: self.options.max_duration.as_secs_f64(),
            min_duration_secs: self.options.min_duration.as_secs_f64(),
            recording_secs: self.recorder.duration().as_secs_f64(),
            error_count: self.error_count.load(Ordering::SeqCst),
        }
    }

    pub fn get_state_summary(&self) -> String {
        let status = self.get_status();
        let mut summary = format!(
            "PTT {} [{}] combo={} enabled={}",
            status.mode, status.state, status.key_combo, status.enabled
        );
        if status.is_recording {
            summary.push_str(&format!(" recording={:.1}s", status.recording_secs));
        }
        if status.error_count > 0 {
            summary.push_str(&format!(" errors={}", status.error_count));
        }
        summary
    }
}

impl Drop for PttController {
    fn drop(&mut self) {
        // Skip when an owner already tore the controller down.
        if self.is_enabled() || self.dispatch.is_some() {
            self.disable();
        }
    }
}

/// Key callbacks: each one only enqueues.
fn key_callbacks(tx: &EventSender, mode: PttMode) -> KeyCallbacks {
    let press = tx.clone();
    let release = tx.clone();
    let cancel = tx.clone();
    let error = tx.clone();
    KeyCallbacks {
        on_press: Arc::new(move |_| {
            press.send(PttEvent::start(Trigger::KeyPress));
        }),
        on_release: Arc::new(move |_| {
            if mode.stops_on_release() {
                release.send(PttEvent::stop(Trigger::KeyRelease));
            }
        }),
        on_cancel: Arc::new(move |_| {
            cancel.send(PttEvent::cancel(Trigger::CancelKey.as_str()));
        }),
        on_error: Arc::new(move |e| {
            error.send(PttEvent::error(PttError::from(e)));
        }),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher (runs on ptt-dispatch)
// ---------------------------------------------------------------------------

struct Dispatcher {
    options: ControllerOptions,
    machine: Arc<PttStateMachine>,
    recorder: AsyncAudioRecorder,
    recovery: Recovery,
    observers: ObserverSet,
    /// For timer tasks to enqueue into the same queue.
    events: EventSender,
    receiver: EventReceiver,
    shutdown: CancellationToken,
    enabled: Arc<AtomicBool>,
    error_count: Arc<AtomicU32>,
    vad: VadDetector,
    /// Generation of the current (or last) recording.
    cycle: u64,
    cycle_tasks: Vec<tokio::task::JoinHandle<()>>,
    /// A hold-mode release arrived early and a stop is scheduled.
    stop_deferred: bool,
}

impl Dispatcher {
    async fn process_events(mut self) {
        log::debug!("ptt: dispatch loop started");
        while !self.shutdown.is_cancelled() {
            let Some(event) = self.receiver.wait_for_event(POLL_INTERVAL).await else {
                if self.receiver.is_closed() {
                    break;
                }
                continue;
            };
            if self.shutdown.is_cancelled() {
                break;
            }

            log::debug!(
                "ptt: handling {:?} (queued {:?} ago)",
                event.kind,
                event.timestamp.elapsed()
            );
            let result = match event.kind {
                PttEventKind::StartRecording { trigger } => self.handle_start_recording(trigger).await,
                PttEventKind::StopRecording { trigger, cycle } => {
                    self.handle_stop_recording(trigger, cycle).await
                }
                PttEventKind::Cancel { reason } => self.handle_cancel(&reason).await,
                PttEventKind::Error { error } => {
                    self.handle_error(error).await;
                    Ok(())
                }
            };
            if let Err(error) = result {
                self.report(error);
                self.restore().await;
            }
        }

        self.abort_cycle_tasks();
        self.recorder.cancel().await;
        log::debug!("ptt: dispatch loop stopped");
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    async fn handle_start_recording(&mut self, trigger: Trigger) -> Result<(), PttError> {
        match self.machine.current() {
            PttState::WaitingForKey => {}
            PttState::Recording if self.options.mode == PttMode::Toggle => {
                return self.finish_recording(trigger).await;
            }
            state => {
                log::debug!("ptt: ignoring start ({trigger}) in state {state}");
                return Ok(());
            }
        }

        self.machine.transition(PttState::KeyPressed, trigger.as_str())?;

        let recorder = self.recorder.clone();
        let recovery = self.recovery.clone();
        let started = retry_with_remediation_async(
            Operation::AudioStart,
            self.options.retry,
            |_| {
                let recorder = recorder.clone();
                async move { recorder.start().await.map_err(PttError::from) }
            },
            |e| recovery.recover_from_error(Operation::AudioStart, e),
        )
        .await;

        match started {
            Ok(true) => {}
            Ok(false) => log::warn!("ptt: recorder was already running"),
            Err(error) => {
                self.report(error);
                self.machine.reset();
                self.rearm();
                return Ok(());
            }
        }

        self.machine.transition(PttState::Recording, trigger.as_str())?;
        self.cycle += 1;
        self.stop_deferred = false;
        self.spawn_timeout();
        if self.options.mode == PttMode::Hybrid {
            self.spawn_silence_watcher();
        }
        self.observers.notify_start();
        Ok(())
    }

    async fn handle_stop_recording(
        &mut self,
        trigger: Trigger,
        cycle: Option<u64>,
    ) -> Result<(), PttError> {
        if let Some(cycle) = cycle {
            if cycle != self.cycle {
                log::debug!("ptt: ignoring stale stop ({trigger}) from cycle {cycle}");
                return Ok(());
            }
        }
        if !self.machine.is_recording() {
            log::debug!("ptt: ignoring stop ({trigger}) in state {}", self.machine.current());
            return Ok(());
        }

        if trigger == Trigger::KeyRelease {
            if !self.options.mode.stops_on_release() {
                return Ok(());
            }
            if self.stop_deferred {
                log::debug!("ptt: stop already scheduled, ignoring release");
                return Ok(());
            }
            let elapsed = self.recorder.duration();
            if elapsed < self.options.min_duration {
                let wait = self.options.min_duration - elapsed;
                log::debug!("ptt: release after {elapsed:?}, deferring stop by {wait:?}");
                self.stop_deferred = true;
                self.spawn_stop_after(wait, Trigger::MinDurationReached);
                return Ok(());
            }
        }

        self.finish_recording(trigger).await
    }

    async fn finish_recording(&mut self, trigger: Trigger) -> Result<(), PttError> {
        self.abort_cycle_tasks();
        self.machine.transition(PttState::RecordingStopped, trigger.as_str())?;

        let duration = self.recorder.duration();
        let samples = self.recorder.stop().await.unwrap_or_default();
        self.machine.transition(PttState::Processing, trigger.as_str())?;

        let sample_rate = self.recorder.monitor().sample_rate().unwrap_or(0);
        let speech_detected = self.vad.contains_speech(&samples, sample_rate);
        log::info!(
            "ptt: recording stopped by {trigger} after {:.2}s ({} samples, speech: {speech_detected})",
            duration.as_secs_f32(),
            samples.len()
        );
        self.observers.notify_stop(&CapturedAudio {
            samples,
            sample_rate,
            duration,
            speech_detected,
        });

        self.machine.transition(PttState::Idle, "processed")?;
        self.rearm();
        Ok(())
    }

    async fn handle_cancel(&mut self, reason: &str) -> Result<(), PttError> {
        match self.machine.current() {
            PttState::Recording => {
                self.abort_cycle_tasks();
                self.machine.transition(PttState::RecordingCancelled, reason)?;
                self.recorder.cancel().await;
                log::info!("ptt: recording cancelled ({reason})");
                self.observers.notify_cancel();
                self.machine.transition(PttState::Idle, "cancelled")?;
                self.rearm();
            }
            PttState::WaitingForKey => {
                log::info!("ptt: cancelled while waiting for key ({reason})");
                self.observers.notify_cancel();
            }
            state => log::debug!("ptt: ignoring cancel ({reason}) in state {state}"),
        }
        Ok(())
    }

    async fn handle_error(&mut self, error: PttError) {
        let keyboard_failure = matches!(
            error,
            PttError::Hotkey(_) | PttError::Permission { subsystem: "keyboard", .. }
        );
        if !keyboard_failure {
            self.report(error);
            self.restore().await;
            return;
        }

        // Counted once here, whatever the outcome of the recovery.
        self.error_count.fetch_add(1, Ordering::SeqCst);
        if !self.recovery.recover_from_error(Operation::KeyboardInit, &error) {
            self.notify_error(&error);
            return;
        }

        // The first attempt already failed (that is what got us here).
        let recovery = self.recovery.clone();
        let budget = RetryPolicy {
            max_retries: self.options.retry.max_retries.saturating_sub(1),
            ..self.options.retry
        };
        tokio::time::sleep(self.options.retry.delay(1)).await;
        if self.shutdown.is_cancelled() {
            log::debug!("ptt: shutting down, keyboard listener not restarted");
            return;
        }
        let shutdown = self.shutdown.clone();
        let restarted = retry_with_remediation_async(
            Operation::KeyboardInit,
            budget,
            |_| {
                let keyboard = Arc::clone(&recovery.keyboard);
                let shutdown = shutdown.clone();
                async move {
                    let restart = move || {
                        if shutdown.is_cancelled() {
                            return Ok(false);
                        }
                        lock_keyboard(&keyboard).start()
                    };
                    match tokio::task::spawn_blocking(restart).await {
                        Ok(started) => started.map(|_| ()).map_err(PttError::from),
                        Err(e) => Err(PttError::Internal(format!("keyboard restart task failed: {e}"))),
                    }
                }
            },
            |e| recovery.recover_from_error(Operation::KeyboardInit, e),
        )
        .await;

        match restarted {
            Ok(()) => log::info!("ptt: keyboard listener recovered"),
            Err(PttError::RetriesExhausted { attempts, last, .. }) => {
                self.notify_error(&PttError::RetriesExhausted {
                    operation: Operation::KeyboardInit,
                    attempts: attempts + 1,
                    last,
                });
            }
            Err(e) => self.notify_error(&e),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn report(&self, error: PttError) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
        self.notify_error(&error);
    }

    /// Log and fan out without counting.
    fn notify_error(&self, error: &PttError) {
        log::error!("ptt: {error}");
        self.observers.notify_error(error);
    }

    /// Get back to a consistent armed state after a failed handler.
    async fn restore(&mut self) {
        self.abort_cycle_tasks();
        if self.machine.current() != PttState::WaitingForKey {
            self.recorder.cancel().await;
            self.machine.reset();
            self.rearm();
        }
    }

    fn rearm(&self) {
        if !self.enabled.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return;
        }
        if self.machine.current() == PttState::Idle {
            // Only fails if someone else moved the machine; already logged.
            let _ = self.machine.transition(PttState::WaitingForKey, "re-arm");
        }
    }

    fn abort_cycle_tasks(&mut self) {
        for task in self.cycle_tasks.drain(..) {
            task.abort();
        }
        self.stop_deferred = false;
    }

    fn spawn_stop_after(&mut self, delay: Duration, trigger: Trigger) {
        let tx = self.events.clone();
        let cycle = self.cycle;
        self.cycle_tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tx.send(PttEvent::stop_for_cycle(trigger, cycle));
        }));
    }

    fn spawn_timeout(&mut self) {
        self.spawn_stop_after(self.options.max_duration, Trigger::MaxDuration);
    }

    fn spawn_silence_watcher(&mut self) {
        let tx = self.events.clone();
        let cycle = self.cycle;
        let threshold = self.options.silence_threshold;
        let monitor = self.recorder.monitor().clone();
        self.cycle_tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SILENCE_POLL);
            loop {
                tick.tick().await;
                if monitor.silence_elapsed().is_some_and(|s| s >= threshold) {
                    tx.send(PttEvent::stop_for_cycle(Trigger::Silence, cycle));
                    return;
                }
            }
        }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
