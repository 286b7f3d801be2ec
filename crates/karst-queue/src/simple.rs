//! FIFO queue with condvar waits, alarms and wake-signal attachment.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::signal::WakeSignal;

struct State<T> {
    items: VecDeque<T>,
    signal: Option<Arc<WakeSignal>>,
    alarm: Option<Instant>,
    shutdown: bool,
}

/// Thread-safe FIFO.
///
/// Consumers either block on [`wait_for_work`](Queue::wait_for_work) or
/// attach the queue to a shared [`WakeSignal`] and poll with
/// [`try_pop`](Queue::try_pop) after each wake. After `shutdown()`, pushes
/// are silently dropped and waits return `false`.
pub struct Queue<T> {
    state: Mutex<State<T>>,
    cv: Condvar,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                signal: None,
                alarm: None,
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Attach to a wake signal; pushes will signal it. If items are already
    /// queued, the signal fires immediately.
    pub fn attach(&self, signal: &Arc<WakeSignal>) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.signal = Some(signal.clone());
        if !state.items.is_empty() {
            signal.signal();
        }
    }

    pub fn detach(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.signal = None;
    }

    /// Push an item. Returns `false` when the queue is shut down and the
    /// item was dropped.
    pub fn push(&self, item: T) -> bool {
        let signal;
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shutdown {
                return false;
            }
            state.items.push_back(item);
            signal = state.signal.clone();
        }
        self.cv.notify_all();
        if let Some(signal) = signal {
            signal.signal();
        }
        true
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.items.pop_front()
    }

    pub fn drain_all(&self) -> Vec<T> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.items.drain(..).collect()
    }

    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let n = max.min(state.items.len());
        state.items.drain(..n).collect()
    }

    /// Set an alarm wakeup; a pending later alarm is kept.
    pub fn set_alarm(&self, when: Instant) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        match state.alarm {
            Some(existing) if existing >= when => {}
            _ => state.alarm = Some(when),
        }
        drop(state);
        self.cv.notify_all();
    }

    pub fn clear_alarm(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.alarm = None;
    }

    /// Block until work is queued, the alarm fires, or shutdown.
    ///
    /// Does not pop. Returns `false` only on shutdown.
    pub fn wait_for_work(&self) -> bool {
        let mut state = self.state.lock().expect("queue lock poisoned");
        loop {
            if state.shutdown {
                return false;
            }
            if !state.items.is_empty() {
                return true;
            }
            match state.alarm {
                Some(alarm) => {
                    let now = Instant::now();
                    if now >= alarm {
                        state.alarm = None;
                        return true;
                    }
                    let (next, _) = self
                        .cv
                        .wait_timeout(state, alarm - now)
                        .expect("queue lock poisoned");
                    state = next;
                }
                None => {
                    state = self.cv.wait(state).expect("queue lock poisoned");
                }
            }
        }
    }

    /// Bounded wait variant. Returns `false` only on shutdown.
    pub fn wait_for_work_timeout(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut state = self.state.lock().expect("queue lock poisoned");
        loop {
            if state.shutdown {
                return false;
            }
            if !state.items.is_empty() {
                return true;
            }
            let now = Instant::now();
            let until = match state.alarm {
                Some(alarm) if alarm < deadline => alarm,
                _ => deadline,
            };
            if now >= until {
                if state.alarm.is_some_and(|a| now >= a) {
                    state.alarm = None;
                }
                return true;
            }
            let (next, _) = self
                .cv
                .wait_timeout(state, until - now)
                .expect("queue lock poisoned");
            state = next;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake all waiters and drop future pushes. Queued items can still be
    /// drained.
    pub fn shutdown(&self) {
        let signal;
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.shutdown = true;
            signal = state.signal.clone();
        }
        self.cv.notify_all();
        if let Some(signal) = signal {
            signal.signal();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().expect("queue lock poisoned").shutdown
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = Queue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.drain_up_to(1), vec![2]);
        assert_eq!(q.drain_all(), vec![3]);
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn shutdown_drops_pushes_and_wakes() {
        let q = Arc::new(Queue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.wait_for_work());
        thread::sleep(Duration::from_millis(20));
        q.shutdown();
        assert!(!handle.join().unwrap());
        q.push(9);
        assert!(q.is_empty());
    }

    #[test]
    fn alarm_wakes_without_items() {
        let q: Queue<u32> = Queue::new();
        q.set_alarm(Instant::now() + Duration::from_millis(10));
        assert!(q.wait_for_work());
        assert!(q.is_empty());
    }

    #[test]
    fn attached_signal_fires_on_push() {
        let q = Queue::new();
        let signal = Arc::new(WakeSignal::new());
        q.attach(&signal);
        q.push(1u32);
        assert!(signal.wait());
    }
}
