//! Push-to-talk state machine.
//!
//! ```text
//! Idle ──enable──▶ WaitingForKey ──press──▶ KeyPressed ──audio up──▶ Recording
//!  ▲                    │                                              │    │
//!  │◀──────disable──────┘                                     stop ────┘    └──── cancel
//!  │                                                            ▼                 ▼
//!  │                                                   RecordingStopped   RecordingCancelled
//!  │                                                            │                 │
//!  │                                                            ▼                 │
//!  ├◀──────────────────────────────────────────────────── Processing              │
//!  └◀─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the edges drawn above are legal.  `RecordingStopped → Idle` is not:
//! every finished recording passes through `Processing`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

/// Number of transitions kept in [`PttStateMachine::history`].
pub const HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// PttState
// ---------------------------------------------------------------------------

/// States of one push-to-talk controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PttState {
    /// Disabled; nothing is listening.
    Idle,
    /// Listening for the key combination.
    WaitingForKey,
    /// Combination pressed; the microphone is being opened.
    KeyPressed,
    /// Audio is being captured.
    Recording,
    /// Capture ended normally; the buffer is being collected.
    RecordingStopped,
    /// Capture aborted; the buffer is discarded.
    RecordingCancelled,
    /// Speech detection and observer delivery.
    Processing,
}

impl PttState {
    pub const ALL: [PttState; 7] = [
        PttState::Idle,
        PttState::WaitingForKey,
        PttState::KeyPressed,
        PttState::Recording,
        PttState::RecordingStopped,
        PttState::RecordingCancelled,
        PttState::Processing,
    ];

    /// Legal targets from `self`.
    ///
    /// ```
    /// use ptt_voice::ptt::PttState;
    ///
    /// assert_eq!(PttState::Idle.allowed_targets(), &[PttState::WaitingForKey]);
    /// assert!(!PttState::RecordingStopped.allowed_targets().contains(&PttState::Idle));
    /// ```
    pub fn allowed_targets(self) -> &'static [PttState] {
        use PttState::*;
        match self {
            Idle => &[WaitingForKey],
            WaitingForKey => &[KeyPressed, Idle],
            KeyPressed => &[Recording],
            Recording => &[RecordingStopped, RecordingCancelled],
            RecordingStopped => &[Processing],
            RecordingCancelled => &[Idle],
            Processing => &[Idle],
        }
    }

    /// `true` while the controller is armed or busy.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PttState::WaitingForKey | PttState::KeyPressed | PttState::Recording | PttState::Processing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PttState::Idle => "idle",
            PttState::WaitingForKey => "waiting_for_key",
            PttState::KeyPressed => "key_pressed",
            PttState::Recording => "recording",
            PttState::RecordingStopped => "recording_stopped",
            PttState::RecordingCancelled => "recording_cancelled",
            PttState::Processing => "processing",
        }
    }
}

impl fmt::Display for PttState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// InvalidTransition / TransitionRecord
// ---------------------------------------------------------------------------

/// A transition outside the table was requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid state transition {from} -> {to} (trigger: {trigger})")]
pub struct InvalidTransition {
    pub from: PttState,
    pub to: PttState,
    pub trigger: String,
}

/// One entry of the transition history.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: PttState,
    pub to: PttState,
    pub trigger: String,
    pub at: Instant,
}

/// Invoked after every successful transition as `(from, to, trigger)`.
pub type StateChangeCallback = Arc<dyn Fn(PttState, PttState, &str) + Send + Sync>;

// ---------------------------------------------------------------------------
// PttStateMachine
// ---------------------------------------------------------------------------

struct Inner {
    current: PttState,
    previous: Option<PttState>,
    entered_at: Instant,
    history: VecDeque<TransitionRecord>,
}

impl Inner {
    fn record(&mut self, to: PttState, trigger: &str) -> PttState {
        let from = self.current;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        let now = Instant::now();
        self.history.push_back(TransitionRecord {
            from,
            to,
            trigger: trigger.to_string(),
            at: now,
        });
        self.previous = Some(from);
        self.current = to;
        self.entered_at = now;
        from
    }
}

/// Thread-safe state holder.
///
/// All methods take `&self`; the internal lock is held only for the
/// in-memory update, and the change callback runs after it is released so a
/// callback may itself query or drive the machine.
pub struct PttStateMachine {
    inner: Mutex<Inner>,
    on_state_change: Mutex<Option<StateChangeCallback>>,
}

impl PttStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: PttState::Idle,
                previous: None,
                entered_at: Instant::now(),
                history: VecDeque::with_capacity(HISTORY_LIMIT),
            }),
            on_state_change: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_on_state_change(&self, callback: StateChangeCallback) {
        let mut slot = self
            .on_state_change
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(callback);
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// [`InvalidTransition`] when `(current, to)` is not in the table; the
    /// state is left unchanged.
    pub fn transition(&self, to: PttState, trigger: &str) -> Result<(), InvalidTransition> {
        let from = {
            let mut inner = self.lock();
            let from = inner.current;
            if !from.allowed_targets().contains(&to) {
                let error = InvalidTransition {
                    from,
                    to,
                    trigger: trigger.to_string(),
                };
                log::error!("ptt: {error}");
                return Err(error);
            }
            inner.record(to, trigger)
        };

        log::debug!("ptt: {from} -> {to} ({trigger})");
        self.notify(from, to, trigger);
        Ok(())
    }

    /// Force the machine back to `Idle`, bypassing the table.
    pub fn reset(&self) {
        let from = {
            let mut inner = self.lock();
            if inner.current == PttState::Idle {
                return;
            }
            inner.record(PttState::Idle, "reset")
        };
        log::debug!("ptt: {from} -> idle (reset)");
        self.notify(from, PttState::Idle, "reset");
    }

    fn notify(&self, from: PttState, to: PttState, trigger: &str) {
        let callback = self
            .on_state_change
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(from, to, trigger))).is_err() {
                log::error!("ptt: state-change callback panicked on {from} -> {to}");
            }
        }
    }

    pub fn can_transition(&self, to: PttState) -> bool {
        self.current().allowed_targets().contains(&to)
    }

    pub fn current(&self) -> PttState {
        self.lock().current
    }

    pub fn previous(&self) -> Option<PttState> {
        self.lock().previous
    }

    pub fn is_active(&self) -> bool {
        self.current().is_active()
    }

    pub fn is_recording(&self) -> bool {
        self.current() == PttState::Recording
    }

    pub fn valid_transitions(&self) -> HashSet<PttState> {
        self.current().allowed_targets().iter().copied().collect()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn time_in_state(&self) -> Duration {
        self.lock().entered_at.elapsed()
    }
}

impl Default for PttStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Drive a fresh machine into `target` along legal edges.
    fn machine_in(target: PttState) -> PttStateMachine {
        use PttState::*;
        let path: &[PttState] = match target {
            Idle => &[],
            WaitingForKey => &[WaitingForKey],
            KeyPressed => &[WaitingForKey, KeyPressed],
            Recording => &[WaitingForKey, KeyPressed, Recording],
            RecordingStopped => &[WaitingForKey, KeyPressed, Recording, RecordingStopped],
            RecordingCancelled => &[WaitingForKey, KeyPressed, Recording, RecordingCancelled],
            Processing => &[WaitingForKey, KeyPressed, Recording, RecordingStopped, Processing],
        };
        let machine = PttStateMachine::new();
        for step in path {
            machine.transition(*step, "setup").unwrap();
        }
        assert_eq!(machine.current(), target);
        machine
    }

    #[test]
    fn illegal_transitions_leave_state_unchanged() {
        for from in PttState::ALL {
            for to in PttState::ALL {
                if from.allowed_targets().contains(&to) {
                    continue;
                }
                let machine = machine_in(from);
                let err = machine.transition(to, "test").unwrap_err();
                assert_eq!((err.from, err.to), (from, to));
                assert_eq!(machine.current(), from, "{from} -> {to} must be rejected");
                assert!(!machine.can_transition(to));
            }
        }
    }

    #[test]
    fn stopped_recording_must_pass_through_processing() {
        let machine = machine_in(PttState::RecordingStopped);
        assert!(machine.transition(PttState::Idle, "fast path").is_err());
        assert_eq!(machine.current(), PttState::RecordingStopped);
        machine.transition(PttState::Processing, "stop").unwrap();
        machine.transition(PttState::Idle, "done").unwrap();
    }

    #[test]
    fn is_recording_iff_recording() {
        for state in PttState::ALL {
            assert_eq!(machine_in(state).is_recording(), state == PttState::Recording);
        }
    }

    #[test]
    fn active_states() {
        let active: Vec<_> = PttState::ALL.into_iter().filter(|s| s.is_active()).collect();
        assert_eq!(
            active,
            vec![
                PttState::WaitingForKey,
                PttState::KeyPressed,
                PttState::Recording,
                PttState::Processing
            ]
        );
    }

    #[test]
    fn valid_transitions_from_idle() {
        let machine = PttStateMachine::new();
        assert_eq!(machine.valid_transitions(), HashSet::from([PttState::WaitingForKey]));
    }

    #[test]
    fn history_is_bounded_and_tracks_previous() {
        let machine = PttStateMachine::new();
        for _ in 0..60 {
            machine.transition(PttState::WaitingForKey, "on").unwrap();
            machine.transition(PttState::Idle, "off").unwrap();
        }
        let history = machine.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().map(|r| r.to), Some(PttState::Idle));
        assert_eq!(machine.previous(), Some(PttState::WaitingForKey));
    }

    #[test]
    fn reset_bypasses_table() {
        let machine = machine_in(PttState::Recording);
        machine.reset();
        assert_eq!(machine.current(), PttState::Idle);
        assert_eq!(machine.history().last().map(|r| r.trigger.as_str()), Some("reset"));
    }

    #[test]
    fn callback_runs_outside_lock_and_panics_are_contained() {
        let machine = Arc::new(PttStateMachine::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let m = Arc::downgrade(&machine);
        let c = Arc::clone(&calls);
        machine.set_on_state_change(Arc::new(move |_, to, _| {
            c.fetch_add(1, Ordering::SeqCst);
            // Re-entrant read; would deadlock if the lock were held.
            if let Some(m) = m.upgrade() {
                assert_eq!(m.current(), to);
            }
            if to == PttState::KeyPressed {
                panic!("observer bug");
            }
        }));

        machine.transition(PttState::WaitingForKey, "enable").unwrap();
        machine.transition(PttState::KeyPressed, "press").unwrap();
        assert_eq!(machine.current(), PttState::KeyPressed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
