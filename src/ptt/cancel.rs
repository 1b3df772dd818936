//! One-shot cancellation flag with callback fan-out.
//!
//! A [`CancellationToken`] is shared between whoever may interrupt a
//! recording (a signal handler, a UI button, a conversation loop) and the
//! controller.  Cancellation is cooperative: the token only flips a flag and
//! runs callbacks; the holders poll it or react to the callback.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle returned by [`CancellationToken::on_cancel`].
pub type CallbackId = u64;

type CancelCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    reason: Option<String>,
    callbacks: Vec<(CallbackId, CancelCallback)>,
    next_id: CallbackId,
}

/// Cloneable cancellation handle; clones share one flag.
///
/// ```
/// use ptt_voice::ptt::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
///
/// assert!(token.cancel("user pressed stop"));
/// assert!(!token.cancel("again"));
/// assert!(observer.is_cancelled());
/// assert_eq!(observer.reason().as_deref(), Some("user pressed stop"));
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<Mutex<TokenState>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flip the flag.  Only the first call runs the callbacks and returns
    /// `true`; callbacks run after the lock is released.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let callbacks: Vec<CancelCallback> = {
            let mut state = self.lock();
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            state.reason = Some(reason.clone());
            state.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        log::debug!("cancel: {reason}");
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&reason))).is_err() {
                log::error!("cancel: callback panicked");
            }
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Reason passed to the winning [`cancel`](Self::cancel) call.
    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    /// Register `callback`.  If the token is already cancelled it runs
    /// immediately on the calling thread.
    pub fn on_cancel<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let callback: CancelCallback = Arc::new(callback);
        let (id, fire_now) = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.callbacks.push((id, Arc::clone(&callback)));
            let fire_now = if state.cancelled {
                state.reason.clone()
            } else {
                None
            };
            (id, fire_now)
        };
        if let Some(reason) = fire_now {
            if catch_unwind(AssertUnwindSafe(|| callback(&reason))).is_err() {
                log::error!("cancel: callback panicked");
            }
        }
        id
    }

    /// Unregister a callback.  Returns `false` for an unknown id.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut state = self.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(cb_id, _)| *cb_id != id);
        state.callbacks.len() != before
    }

    /// Clear the flag so the token can be reused.  Registered callbacks stay.
    ///
    /// The caller must make sure nothing still acts on the previous
    /// cancellation; a holder that polled `is_cancelled()` just before the
    /// reset will not see it.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.cancelled = false;
        state.reason = None;
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CancellationToken")
            .field("cancelled", &state.cancelled)
            .field("reason", &state.reason)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn concurrent_cancel_fans_out_once() {
        for _ in 0..50 {
            let token = CancellationToken::new();
            let fired = Arc::new(AtomicUsize::new(0));
            let f = Arc::clone(&fired);
            token.on_cancel(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let token = token.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        let won = token.cancel(format!("thread {i}"));
                        assert!(token.is_cancelled());
                        won
                    })
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn callbacks_may_reenter_the_token() {
        let token = CancellationToken::new();
        let t = token.clone();
        token.on_cancel(move |_| {
            assert!(t.is_cancelled());
            assert!(!t.cancel("nested"));
        });
        assert!(token.cancel("outer"));
        assert_eq!(token.reason().as_deref(), Some("outer"));
    }

    #[test]
    fn late_registration_fires_immediately() {
        let token = CancellationToken::new();
        token.cancel("early");
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        token.on_cancel(move |reason| {
            *s.lock().unwrap() = Some(reason.to_string());
        });
        assert_eq!(seen.lock().unwrap().as_deref(), Some("early"));
    }

    #[test]
    fn removed_callbacks_do_not_fire() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let id = token.on_cancel(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(token.remove_callback(id));
        assert!(!token.remove_callback(id));
        token.cancel("x");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_allows_a_second_generation() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        token.on_cancel(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel("first");
        token.reset();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
        assert!(token.cancel("second"));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_callback_does_not_stop_fan_out() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        token.on_cancel(|_| panic!("boom"));
        let f = Arc::clone(&fired);
        token.on_cancel(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(token.cancel("x"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
