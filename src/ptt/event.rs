//! Events crossing from OS threads and timer tasks into the dispatch loop.
//!
//! Every producer (key-listener thread, timeout task, silence watcher,
//! cancellation token, error path) holds an [`EventSender`]; the dispatch
//! loop owns the single [`EventReceiver`].  The channel is unbounded so a
//! send from the key-listener thread never blocks, and events are handled in
//! the order they were sent.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::PttError;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// What caused a start or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    KeyPress,
    KeyRelease,
    /// The per-recording timeout elapsed.
    MaxDuration,
    /// A hold-mode release came early and was deferred to `min_duration`.
    MinDurationReached,
    /// Hybrid mode heard speech followed by enough silence.
    Silence,
    CancelKey,
    /// Requested through the controller API or a cancellation token.
    External,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::KeyPress => "key press",
            Trigger::KeyRelease => "key release",
            Trigger::MaxDuration => "max duration",
            Trigger::MinDurationReached => "min duration reached",
            Trigger::Silence => "silence",
            Trigger::CancelKey => "cancel key",
            Trigger::External => "external",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PttEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PttEventKind {
    StartRecording {
        trigger: Trigger,
    },
    StopRecording {
        trigger: Trigger,
        /// Recording generation a timer-synthesised stop belongs to.
        /// `None` for stops that apply to whatever is recording.
        cycle: Option<u64>,
    },
    Cancel {
        reason: String,
    },
    Error {
        error: PttError,
    },
}

/// A queued event with its enqueue time.
#[derive(Debug, Clone)]
pub struct PttEvent {
    pub kind: PttEventKind,
    pub timestamp: Instant,
}

impl PttEvent {
    pub fn new(kind: PttEventKind) -> Self {
        Self {
            kind,
            timestamp: Instant::now(),
        }
    }

    pub fn start(trigger: Trigger) -> Self {
        Self::new(PttEventKind::StartRecording { trigger })
    }

    pub fn stop(trigger: Trigger) -> Self {
        Self::new(PttEventKind::StopRecording {
            trigger,
            cycle: None,
        })
    }

    pub fn stop_for_cycle(trigger: Trigger, cycle: u64) -> Self {
        Self::new(PttEventKind::StopRecording {
            trigger,
            cycle: Some(cycle),
        })
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::new(PttEventKind::Cancel {
            reason: reason.into(),
        })
    }

    pub fn error(error: PttError) -> Self {
        Self::new(PttEventKind::Error { error })
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Create a connected sender/receiver pair.
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx, closed: false })
}

/// Producer half; cheap to clone, callable from any thread.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<PttEvent>,
}

impl EventSender {
    /// Enqueue without blocking.  Returns `false` once the loop is gone.
    pub fn send(&self, event: PttEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                log::debug!("ptt: dropped {:?}, dispatch loop has exited", event.kind);
                false
            }
        }
    }
}

/// Consumer half, owned by the dispatch loop.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<PttEvent>,
    closed: bool,
}

impl EventReceiver {
    /// Wait up to `timeout` for the next event.
    ///
    /// Returns `None` on timeout (and once every sender is dropped), so the
    /// caller gets a chance to check for shutdown between events.
    pub async fn wait_for_event(&mut self, timeout: Duration) -> Option<PttEvent> {
        if self.closed {
            return None;
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                self.closed = true;
                None
            }
            Err(_elapsed) => None,
        }
    }

    /// `true` once every [`EventSender`] has been dropped and the queue is
    /// drained.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (tx, mut rx) = event_channel();
        tx.send(PttEvent::start(Trigger::KeyPress));
        tx.send(PttEvent::stop_for_cycle(Trigger::MaxDuration, 1));
        tx.send(PttEvent::stop(Trigger::KeyRelease));

        let timeout = Duration::from_millis(50);
        let kinds: Vec<_> = [
            rx.wait_for_event(timeout).await,
            rx.wait_for_event(timeout).await,
            rx.wait_for_event(timeout).await,
        ]
        .into_iter()
        .map(|e| e.unwrap().kind)
        .collect();

        assert!(matches!(kinds[0], PttEventKind::StartRecording { trigger: Trigger::KeyPress }));
        assert!(matches!(
            kinds[1],
            PttEventKind::StopRecording { trigger: Trigger::MaxDuration, cycle: Some(1) }
        ));
        assert!(matches!(
            kinds[2],
            PttEventKind::StopRecording { trigger: Trigger::KeyRelease, cycle: None }
        ));
    }

    #[tokio::test]
    async fn wait_times_out_with_none() {
        let (_tx, mut rx) = event_channel();
        let started = Instant::now();
        assert!(rx.wait_for_event(Duration::from_millis(30)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!rx.is_closed());
    }

    #[tokio::test]
    async fn send_from_plain_thread() {
        let (tx, mut rx) = event_channel();
        std::thread::spawn(move || {
            tx.send(PttEvent::cancel("from thread"));
        })
        .join()
        .unwrap();

        let event = rx.wait_for_event(Duration::from_millis(50)).await.unwrap();
        assert!(matches!(event.kind, PttEventKind::Cancel { ref reason } if reason == "from thread"));
        assert!(rx.wait_for_event(Duration::from_millis(10)).await.is_none());
        assert!(rx.is_closed());
    }

    #[test]
    fn send_after_receiver_dropped_reports_false() {
        let (tx, rx) = event_channel();
        drop(rx);
        assert!(!tx.send(PttEvent::start(Trigger::External)));
    }
}
