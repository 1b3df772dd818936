//! Recording lifecycle notifications.
//!
//! UI, telemetry and the blocking [`RecordingSession`](super::RecordingSession)
//! all implement [`RecordingObserver`].  Calls are best-effort: a panicking
//! observer is logged and skipped, the remaining observers still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::PttError;

/// A finished recording as handed to [`RecordingObserver::on_recording_stop`].
#[derive(Debug, Clone)]
pub struct CapturedAudio {
    /// Mono samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// `0` when no chunk was delivered.
    pub sample_rate: u32,
    /// Wall-clock length of the recording.
    pub duration: Duration,
    pub speech_detected: bool,
}

/// Lifecycle hooks, all defaulting to no-ops.  Called on the dispatch thread.
pub trait RecordingObserver: Send + Sync {
    fn on_recording_start(&self) {}

    fn on_recording_stop(&self, _audio: &CapturedAudio) {}

    fn on_recording_cancel(&self) {}

    fn on_error(&self, _error: &PttError) {}
}

// ---------------------------------------------------------------------------
// ObserverSet
// ---------------------------------------------------------------------------

/// Ordered list of observers notified together.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn RecordingObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn RecordingObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn each(&self, hook: &str, f: impl Fn(&dyn RecordingObserver)) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                log::error!("ptt: observer panicked in {hook}");
            }
        }
    }

    pub fn notify_start(&self) {
        self.each("on_recording_start", |o| o.on_recording_start());
    }

    pub fn notify_stop(&self, audio: &CapturedAudio) {
        self.each("on_recording_stop", |o| o.on_recording_stop(audio));
    }

    pub fn notify_cancel(&self) {
        self.each("on_recording_cancel", |o| o.on_recording_cancel());
    }

    pub fn notify_error(&self, error: &PttError) {
        self.each("on_error", |o| o.on_error(error));
    }
}

impl FromIterator<Arc<dyn RecordingObserver>> for ObserverSet {
    fn from_iter<I: IntoIterator<Item = Arc<dyn RecordingObserver>>>(iter: I) -> Self {
        Self {
            observers: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingObserver
// ---------------------------------------------------------------------------

/// Reports the lifecycle through the `log` facade.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl RecordingObserver for LoggingObserver {
    fn on_recording_start(&self) {
        log::info!("ptt: recording…");
    }

    fn on_recording_stop(&self, audio: &CapturedAudio) {
        log::info!(
            "ptt: recorded {:.2}s ({} samples @ {} Hz, speech: {})",
            audio.duration.as_secs_f32(),
            audio.samples.len(),
            audio.sample_rate,
            audio.speech_detected
        );
    }

    fn on_recording_cancel(&self) {
        log::info!("ptt: recording cancelled");
    }

    fn on_error(&self, error: &PttError) {
        log::error!("ptt: {error}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        stops: AtomicUsize,
    }

    impl RecordingObserver for Counter {
        fn on_recording_stop(&self, _audio: &CapturedAudio) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    impl RecordingObserver for Panicky {
        fn on_recording_stop(&self, _audio: &CapturedAudio) {
            panic!("observer bug");
        }
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let counter = Arc::new(Counter::default());
        let set: ObserverSet = [
            Arc::new(Panicky) as Arc<dyn RecordingObserver>,
            counter.clone(),
        ]
        .into_iter()
        .collect();

        set.notify_stop(&CapturedAudio {
            samples: vec![0.0; 10],
            sample_rate: 16_000,
            duration: Duration::from_millis(1),
            speech_detected: false,
        });
        set.notify_start();
        set.notify_cancel();
        assert_eq!(counter.stops.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 2);
    }
}
