//! Multi-queue wake mechanism for single-consumer threads.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct State {
    signaled: bool,
    shutdown: bool,
    deadline: Option<Instant>,
}

/// One-shot-rearmable wake signal.
///
/// A consumer blocks in [`wait`](WakeSignal::wait) while any number of
/// producers call [`signal`](WakeSignal::signal). Queues attached to a signal
/// call it after every push, so one consumer can sleep on several queues.
/// An optional deadline turns the wait into a timed one for frame-paced
/// consumers.
pub struct WakeSignal {
    state: Mutex<State>,
    cv: Condvar,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                signaled: false,
                shutdown: false,
                deadline: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Wake the consumer. Called by producers after making work available.
    pub fn signal(&self) {
        let mut state = self.state.lock().expect("wake signal lock poisoned");
        state.signaled = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Block until signaled, the deadline passes, or shutdown.
    ///
    /// The signaled flag is cleared on return. Returns `false` once shutdown
    /// has been requested.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().expect("wake signal lock poisoned");
        loop {
            if state.shutdown {
                state.signaled = false;
                return false;
            }
            if state.signaled {
                state.signaled = false;
                return true;
            }
            match state.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.deadline = None;
                        state.signaled = false;
                        return true;
                    }
                    let (next, _) = self
                        .cv
                        .wait_timeout(state, deadline - now)
                        .expect("wake signal lock poisoned");
                    state = next;
                }
                None => {
                    state = self.cv.wait(state).expect("wake signal lock poisoned");
                }
            }
        }
    }

    /// Block with an explicit timeout instead of a stored deadline.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("wake signal lock poisoned");
        loop {
            if state.shutdown {
                state.signaled = false;
                return false;
            }
            if state.signaled {
                state.signaled = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (next, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .expect("wake signal lock poisoned");
            state = next;
        }
    }

    /// Set a wakeup deadline. A deadline in the past wakes the next wait
    /// immediately.
    pub fn set_deadline(&self, when: Instant) {
        let mut state = self.state.lock().expect("wake signal lock poisoned");
        state.deadline = Some(when);
        drop(state);
        self.cv.notify_all();
    }

    pub fn clear_deadline(&self) {
        let mut state = self.state.lock().expect("wake signal lock poisoned");
        state.deadline = None;
    }

    /// All current and future waits return `false` after this.
    pub fn request_shutdown(&self) {
        let mut state = self.state.lock().expect("wake signal lock poisoned");
        state.shutdown = true;
        drop(state);
        self.cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state
            .lock()
            .expect("wake signal lock poisoned")
            .shutdown
    }

    /// Clear signaled, deadline and shutdown state for reuse.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("wake signal lock poisoned");
        state.signaled = false;
        state.shutdown = false;
        state.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_wakes_waiter() {
        let signal = Arc::new(WakeSignal::new());
        let s2 = signal.clone();
        let handle = thread::spawn(move || s2.wait());
        thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn past_deadline_wakes_immediately() {
        let signal = WakeSignal::new();
        signal.set_deadline(Instant::now());
        assert!(signal.wait());
    }

    #[test]
    fn shutdown_returns_false() {
        let signal = Arc::new(WakeSignal::new());
        let s2 = signal.clone();
        let handle = thread::spawn(move || s2.wait());
        thread::sleep(Duration::from_millis(20));
        signal.request_shutdown();
        assert!(!handle.join().unwrap());
        // Subsequent waits return false without blocking.
        assert!(!signal.wait());
    }

    #[test]
    fn signal_before_wait_is_not_lost() {
        let signal = WakeSignal::new();
        signal.signal();
        assert!(signal.wait());
    }
}
