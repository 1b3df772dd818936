//! Key event sources: the OS-wide `rdev` listener and a test double.
//!
//! `rdev::listen` is a blocking call that must live on its own OS thread and
//! has **no graceful shutdown API**.  [`RdevKeySource`] therefore spawns that
//! thread once, lazily, and keeps it for the lifetime of the source; each
//! [`KeySource::listen`] call only swaps the sink the thread forwards to, and
//! [`KeyStream::stop`] removes it again.  Repeated enable/disable cycles
//! never pile up blocked listener threads.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc, Arc, Mutex,
};
use std::time::Duration;

use super::{permission_remediation, HotkeyError, KeyEvent};

/// Callback receiving raw key events on the listener thread.
pub type KeySink = Arc<dyn Fn(KeyEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A provider of global key events.
///
/// Implementations must be `Send + Sync` so one source can be built at
/// start-up and shared by every controller created afterwards.
pub trait KeySource: Send + Sync {
    /// Start forwarding events to `sink`.
    ///
    /// # Errors
    ///
    /// [`HotkeyError::PermissionDenied`] when the OS refuses global hooks,
    /// [`HotkeyError::Spawn`] when the listener thread cannot be created.
    fn listen(&self, sink: KeySink) -> Result<Box<dyn KeyStream>, HotkeyError>;
}

/// Handle to an active [`KeySource::listen`] registration.
pub trait KeyStream: Send {
    /// Stop forwarding events.  Calling it more than once is harmless.
    fn stop(&mut self);
}

// ---------------------------------------------------------------------------
// RdevKeySource
// ---------------------------------------------------------------------------

enum ListenerThread {
    NotStarted,
    Running,
    Failed,
}

struct RdevShared {
    /// Registration id + sink currently receiving events.
    sink: Mutex<Option<(u64, KeySink)>>,
    thread: Mutex<ListenerThread>,
    next_id: AtomicU64,
}

impl RdevShared {
    fn current_sink(&self) -> Option<KeySink> {
        self.sink
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|(_, sink)| Arc::clone(sink)))
    }
}

/// Global key source backed by `rdev::listen`.
///
/// Construct one at process start-up and inject it wherever keys are needed.
pub struct RdevKeySource {
    shared: Arc<RdevShared>,
    /// How long [`listen`](KeySource::listen) waits for an immediate failure
    /// of a freshly spawned listener.
    startup_grace: Duration,
}

impl RdevKeySource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RdevShared {
                sink: Mutex::new(None),
                thread: Mutex::new(ListenerThread::NotStarted),
                next_id: AtomicU64::new(1),
            }),
            startup_grace: Duration::from_millis(250),
        }
    }

    /// Spawn the dedicated `rdev::listen` thread.
    ///
    /// Blocks for at most `startup_grace` to catch a listener that fails
    /// straight away (missing permission, no display).
    fn spawn_listener(&self) -> Result<(), HotkeyError> {
        let (ready_tx, ready_rx) = mpsc::channel::<HotkeyError>();
        let shared = Arc::clone(&self.shared);

        std::thread::Builder::new()
            .name("ptt-key-listener".into())
            .spawn(move || {
                let callback_shared = Arc::clone(&shared);
                let result = rdev::listen(move |event| {
                    let key_event = match event.event_type {
                        rdev::EventType::KeyPress(k) => KeyEvent::Press(k),
                        rdev::EventType::KeyRelease(k) => KeyEvent::Release(k),
                        _ => return,
                    };
                    if let Some(sink) = callback_shared.current_sink() {
                        sink(key_event);
                    }
                });

                if let Err(e) = result {
                    log::error!("key-listener: rdev::listen exited with error: {:?}", e);
                    let error = HotkeyError::PermissionDenied {
                        reason: format!("{e:?}"),
                        remediation: permission_remediation(),
                    };
                    if let Ok(mut state) = shared.thread.lock() {
                        *state = ListenerThread::Failed;
                    }
                    // During the start-up grace period the error goes back to
                    // `listen`; afterwards the receiver is gone and the sink
                    // gets it instead.
                    if let Err(mpsc::SendError(error)) = ready_tx.send(error) {
                        if let Some(sink) = shared.current_sink() {
                            sink(KeyEvent::Failed(error));
                        }
                    }
                }
            })
            .map_err(|e| HotkeyError::Spawn(e.to_string()))?;

        match ready_rx.recv_timeout(self.startup_grace) {
            Ok(error) => Err(error),
            // Still blocked inside rdev::listen, which is what success looks like.
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(()),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(HotkeyError::Spawn(
                "key listener thread exited during start-up".into(),
            )),
        }
    }
}

impl Default for RdevKeySource {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySource for RdevKeySource {
    fn listen(&self, sink: KeySink) -> Result<Box<dyn KeyStream>, HotkeyError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = self
                .shared
                .sink
                .lock()
                .map_err(|_| HotkeyError::Spawn("key sink lock poisoned".into()))?;
            *slot = Some((id, sink));
        }

        let needs_thread = {
            let mut state = self
                .shared
                .thread
                .lock()
                .map_err(|_| HotkeyError::Spawn("listener state lock poisoned".into()))?;
            match *state {
                ListenerThread::Running => false,
                // A failed listener thread has exited; a new attempt re-spawns it.
                ListenerThread::NotStarted | ListenerThread::Failed => {
                    *state = ListenerThread::Running;
                    true
                }
            }
        };

        if needs_thread {
            if let Err(error) = self.spawn_listener() {
                if let Ok(mut state) = self.shared.thread.lock() {
                    *state = ListenerThread::Failed;
                }
                if let Ok(mut slot) = self.shared.sink.lock() {
                    if matches!(*slot, Some((current, _)) if current == id) {
                        *slot = None;
                    }
                }
                return Err(error);
            }
            log::info!("key-listener: global listener started");
        }

        Ok(Box::new(RdevKeyStream {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }
}

struct RdevKeyStream {
    shared: Arc<RdevShared>,
    id: u64,
}

impl KeyStream for RdevKeyStream {
    fn stop(&mut self) {
        if let Ok(mut slot) = self.shared.sink.lock() {
            if matches!(*slot, Some((current, _)) if current == self.id) {
                *slot = None;
            }
        }
    }
}

impl Drop for RdevKeyStream {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// MockKeySource (test double)
// ---------------------------------------------------------------------------

/// Key source driven by the test: `press`/`release` call the installed sink
/// synchronously from the calling thread, standing in for the OS thread.
#[cfg(test)]
pub struct MockKeySource {
    sink: Arc<Mutex<Option<KeySink>>>,
    listens: std::sync::atomic::AtomicUsize,
    stops: Arc<std::sync::atomic::AtomicUsize>,
    failures_left: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl MockKeySource {
    pub fn new() -> Arc<Self> {
        Self::failing(0)
    }

    /// A source whose first `failures` calls to `listen` fail.
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            sink: Arc::new(Mutex::new(None)),
            listens: Default::default(),
            stops: Default::default(),
            failures_left: std::sync::atomic::AtomicU32::new(failures),
        })
    }

    fn emit(&self, event: KeyEvent) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    pub fn press(&self, key: rdev::Key) {
        self.emit(KeyEvent::Press(key));
    }

    pub fn release(&self, key: rdev::Key) {
        self.emit(KeyEvent::Release(key));
    }

    /// Press and release `key`.
    pub fn tap(&self, key: rdev::Key) {
        self.press(key);
        self.release(key);
    }

    /// Make the next `failures` calls to `listen` fail.
    pub fn fail_next(&self, failures: u32) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }

    /// Simulate the OS listener dying.
    pub fn fail(&self, error: HotkeyError) {
        self.emit(KeyEvent::Failed(error));
    }

    pub fn is_listening(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    pub fn listen_count(&self) -> usize {
        self.listens.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl KeySource for MockKeySource {
    fn listen(&self, sink: KeySink) -> Result<Box<dyn KeyStream>, HotkeyError> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(HotkeyError::PermissionDenied {
                reason: "mock listener refused".into(),
                remediation: permission_remediation(),
            });
        }
        *self.sink.lock().unwrap() = Some(sink);
        Ok(Box::new(MockKeyStream {
            sink: Arc::clone(&self.sink),
            stops: Arc::clone(&self.stops),
            stopped: false,
        }))
    }
}

#[cfg(test)]
struct MockKeyStream {
    sink: Arc<Mutex<Option<KeySink>>>,
    stops: Arc<std::sync::atomic::AtomicUsize>,
    stopped: bool,
}

#[cfg(test)]
impl KeyStream for MockKeyStream {
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        *self.sink.lock().unwrap() = None;
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_sink() -> (KeySink, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sink: KeySink = Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (sink, count)
    }

    #[test]
    fn rdev_source_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RdevKeySource>();
    }

    #[test]
    fn mock_forwards_until_stopped() {
        let source = MockKeySource::new();
        let (sink, count) = counting_sink();

        let mut stream = source.listen(sink).unwrap();
        source.tap(rdev::Key::F9);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        stream.stop();
        stream.stop();
        source.tap(rdev::Key::F9);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(source.stop_count(), 1);
    }

    #[test]
    fn mock_failures_are_consumed() {
        let source = MockKeySource::failing(1);
        let (sink, _) = counting_sink();

        assert!(source.listen(Arc::clone(&sink)).is_err());
        assert!(source.listen(sink).is_ok());
        assert_eq!(source.listen_count(), 2);
        assert!(source.is_listening());
    }
}
