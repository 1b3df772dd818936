//! Key-combination tracking on top of a [`KeySource`].
//!
//! [`ComboTracker`] is a pure state holder: it consumes raw presses and
//! releases and reports when the configured combination becomes complete or
//! broken.  [`KeyboardHandler`] owns a tracker and a [`KeySource`]
//! registration and invokes the user callbacks.  Callbacks are always invoked
//! after the tracker lock is released.

use std::sync::{Arc, Mutex};

use super::{HotkeyError, KeyCombo, KeyEvent, KeySink, KeySource, KeyStream};

// ---------------------------------------------------------------------------
// ComboTracker
// ---------------------------------------------------------------------------

/// What a raw key event meant for the combination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComboSignal {
    /// The last missing member went down; carries that key.
    Activated(rdev::Key),
    /// A member went up while the combination was active.
    Deactivated(rdev::Key),
    /// The cancel key went down.
    Cancel(rdev::Key),
}

/// Tracks which keys are down and whether the combination is held.
///
/// OS auto-repeat produces a stream of presses for a held key; only the
/// first completion of the combination is reported.
#[derive(Debug)]
pub struct ComboTracker {
    combo: KeyCombo,
    cancel_key: Option<rdev::Key>,
    pressed: Vec<rdev::Key>,
    active: bool,
}

impl ComboTracker {
    pub fn new(combo: KeyCombo, cancel_key: Option<rdev::Key>) -> Self {
        Self {
            combo,
            cancel_key,
            pressed: Vec::new(),
            active: false,
        }
    }

    /// Feed a press; returns the resulting signal, if any.
    pub fn press(&mut self, key: rdev::Key) -> Option<ComboSignal> {
        if !self.pressed.contains(&key) {
            self.pressed.push(key);
        }

        if self.cancel_key == Some(key) && !self.combo.contains(key) {
            return Some(ComboSignal::Cancel(key));
        }

        if !self.active && self.combo.is_satisfied(&self.pressed) {
            self.active = true;
            return Some(ComboSignal::Activated(key));
        }
        None
    }

    /// Feed a release; returns the resulting signal, if any.
    pub fn release(&mut self, key: rdev::Key) -> Option<ComboSignal> {
        self.pressed.retain(|k| *k != key);

        if self.active && !self.combo.is_satisfied(&self.pressed) {
            self.active = false;
            return Some(ComboSignal::Deactivated(key));
        }
        None
    }

    /// Forget all pressed keys (after the listener is re-registered the
    /// previous key state is unknown).
    pub fn clear(&mut self) {
        self.pressed.clear();
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

// ---------------------------------------------------------------------------
// KeyCallbacks
// ---------------------------------------------------------------------------

/// Callbacks invoked from the listener thread.  They must return quickly.
#[derive(Clone)]
pub struct KeyCallbacks {
    pub on_press: Arc<dyn Fn(rdev::Key) + Send + Sync>,
    pub on_release: Arc<dyn Fn(rdev::Key) + Send + Sync>,
    pub on_cancel: Arc<dyn Fn(rdev::Key) + Send + Sync>,
    pub on_error: Arc<dyn Fn(HotkeyError) + Send + Sync>,
}

impl Default for KeyCallbacks {
    fn default() -> Self {
        Self {
            on_press: Arc::new(|_| {}),
            on_release: Arc::new(|_| {}),
            on_cancel: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
        }
    }
}

// ---------------------------------------------------------------------------
// KeyboardHandler
// ---------------------------------------------------------------------------

/// Owns one [`KeySource`] registration and reports combination changes.
pub struct KeyboardHandler {
    source: Arc<dyn KeySource>,
    combo: KeyCombo,
    cancel_key: Option<rdev::Key>,
    tracker: Arc<Mutex<ComboTracker>>,
    callbacks: KeyCallbacks,
    stream: Option<Box<dyn KeyStream>>,
}

impl KeyboardHandler {
    pub fn new(source: Arc<dyn KeySource>, combo: KeyCombo, cancel_key: Option<rdev::Key>) -> Self {
        let tracker = ComboTracker::new(combo.clone(), cancel_key);
        Self {
            source,
            combo,
            cancel_key,
            tracker: Arc::new(Mutex::new(tracker)),
            callbacks: KeyCallbacks::default(),
            stream: None,
        }
    }

    /// Replace the callbacks.  Takes effect on the next [`start`](Self::start).
    pub fn set_callbacks(&mut self, callbacks: KeyCallbacks) {
        self.callbacks = callbacks;
    }

    /// Register with the key source.
    ///
    /// Returns `Ok(false)` if the handler is already running.
    pub fn start(&mut self) -> Result<bool, HotkeyError> {
        if self.stream.is_some() {
            return Ok(false);
        }

        self.tracker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();

        let tracker = Arc::clone(&self.tracker);
        let callbacks = self.callbacks.clone();
        let sink: KeySink = Arc::new(move |event| {
            let signal = match event {
                KeyEvent::Press(key) => tracker.lock().unwrap_or_else(|p| p.into_inner()).press(key),
                KeyEvent::Release(key) => tracker.lock().unwrap_or_else(|p| p.into_inner()).release(key),
                KeyEvent::Failed(error) => {
                    (callbacks.on_error)(error);
                    return;
                }
            };
            match signal {
                Some(ComboSignal::Activated(key)) => (callbacks.on_press)(key),
                Some(ComboSignal::Deactivated(key)) => (callbacks.on_release)(key),
                Some(ComboSignal::Cancel(key)) => (callbacks.on_cancel)(key),
                None => {}
            }
        });

        let stream = self.source.listen(sink)?;
        self.stream = Some(stream);
        log::debug!("keyboard: listening for {}", self.combo);
        Ok(true)
    }

    /// Unregister from the key source.  Safe to call when not running.
    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            log::debug!("keyboard: stopped listening for {}", self.combo);
        }
    }

    /// Tear down and register again.
    pub fn restart(&mut self) -> Result<bool, HotkeyError> {
        self.stop();
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    pub fn combo(&self) -> &KeyCombo {
        &self.combo
    }

    pub fn cancel_key(&self) -> Option<rdev::Key> {
        self.cancel_key
    }
}

impl Drop for KeyboardHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotkey::MockKeySource;
    use rdev::Key;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker(combo: &str) -> ComboTracker {
        ComboTracker::new(KeyCombo::parse(combo).unwrap(), Some(Key::Escape))
    }

    #[test]
    fn combo_activates_once_despite_auto_repeat() {
        let mut t = tracker("ctrl+space");
        assert_eq!(t.press(Key::ControlLeft), None);
        assert_eq!(t.press(Key::Space), Some(ComboSignal::Activated(Key::Space)));
        assert_eq!(t.press(Key::Space), None);
        assert_eq!(t.press(Key::Space), None);
        assert!(t.is_active());
    }

    #[test]
    fn releasing_any_member_deactivates() {
        let mut t = tracker("ctrl+space");
        t.press(Key::ControlRight);
        t.press(Key::Space);
        assert_eq!(
            t.release(Key::ControlRight),
            Some(ComboSignal::Deactivated(Key::ControlRight))
        );
        assert_eq!(t.release(Key::Space), None);
        assert!(!t.is_active());
    }

    #[test]
    fn unrelated_keys_are_ignored() {
        let mut t = tracker("F9");
        assert_eq!(t.press(Key::KeyA), None);
        assert_eq!(t.release(Key::KeyA), None);
        assert_eq!(t.press(Key::F9), Some(ComboSignal::Activated(Key::F9)));
    }

    #[test]
    fn cancel_key_is_reported() {
        let mut t = tracker("F9");
        assert_eq!(t.press(Key::Escape), Some(ComboSignal::Cancel(Key::Escape)));
    }

    #[test]
    fn handler_invokes_callbacks() {
        let source = MockKeySource::new();
        let presses = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let cancels = Arc::new(AtomicUsize::new(0));

        let mut handler = KeyboardHandler::new(
            source.clone(),
            KeyCombo::parse("ctrl+space").unwrap(),
            Some(Key::Escape),
        );
        let (p, r, c) = (presses.clone(), releases.clone(), cancels.clone());
        handler.set_callbacks(KeyCallbacks {
            on_press: Arc::new(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            }),
            on_release: Arc::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            }),
            on_cancel: Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            on_error: Arc::new(|_| {}),
        });

        assert!(handler.start().unwrap());
        assert!(!handler.start().unwrap());

        source.press(Key::ControlLeft);
        source.press(Key::Space);
        source.release(Key::Space);
        source.release(Key::ControlLeft);
        source.tap(Key::Escape);

        assert_eq!(presses.load(Ordering::SeqCst), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        handler.stop();
        handler.stop();
        assert!(!handler.is_running());
        assert_eq!(source.stop_count(), 1);

        source.press(Key::ControlLeft);
        source.press(Key::Space);
        assert_eq!(presses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_failure_reaches_on_error() {
        let source = MockKeySource::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let mut handler =
            KeyboardHandler::new(source.clone(), KeyCombo::parse("F9").unwrap(), None);
        let e = errors.clone();
        handler.set_callbacks(KeyCallbacks {
            on_error: Arc::new(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
            ..KeyCallbacks::default()
        });
        handler.start().unwrap();
        source.fail(HotkeyError::Spawn("gone".into()));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn restart_clears_a_poisoned_tracker() {
        let source = MockKeySource::new();
        let presses = Arc::new(AtomicUsize::new(0));
        let mut handler =
            KeyboardHandler::new(source.clone(), KeyCombo::parse("ctrl+space").unwrap(), None);
        let p = presses.clone();
        handler.set_callbacks(KeyCallbacks {
            on_press: Arc::new(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            }),
            ..KeyCallbacks::default()
        });
        handler.start().unwrap();
        source.press(Key::ControlLeft);

        let tracker = Arc::clone(&handler.tracker);
        let _ = std::thread::spawn(move || {
            let _guard = tracker.lock().unwrap();
            panic!("poison the tracker");
        })
        .join();
        assert!(handler.tracker.is_poisoned());

        // The held ctrl is forgotten on restart.
        assert!(handler.restart().unwrap());
        source.press(Key::Space);
        assert_eq!(presses.load(Ordering::SeqCst), 0);

        source.release(Key::Space);
        source.press(Key::ControlLeft);
        source.press(Key::Space);
        assert_eq!(presses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_failure_leaves_handler_stopped() {
        let source = MockKeySource::failing(1);
        let mut handler =
            KeyboardHandler::new(source.clone(), KeyCombo::parse("F9").unwrap(), None);
        assert!(handler.start().is_err());
        assert!(!handler.is_running());
        assert!(handler.restart().unwrap());
    }
}
