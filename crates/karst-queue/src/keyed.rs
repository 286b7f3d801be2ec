//! Deduplicating FIFO keyed by a hashable key, with merge-on-duplicate.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::signal::WakeSignal;

type MergeFn<V> = Box<dyn Fn(&V, V) -> V + Send + Sync>;

struct State<K, V> {
    order: VecDeque<K>,
    data: HashMap<K, V>,
    signal: Option<Arc<WakeSignal>>,
    alarm: Option<Instant>,
    shutdown: bool,
}

/// FIFO that keeps at most one entry per key.
///
/// First push of a key takes a queue slot in insertion order; a duplicate
/// push merges its value into the existing entry via the merge function
/// without moving the slot. The canonical use is the mesh rebuild queue:
/// key = chunk position, merge keeps the highest priority and latest
/// versions.
pub struct KeyedQueue<K, V> {
    state: Mutex<State<K, V>>,
    cv: Condvar,
    merge: MergeFn<V>,
}

impl<K: Eq + Hash + Clone, V> KeyedQueue<K, V> {
    /// Queue whose duplicate pushes replace the stored value.
    pub fn new() -> Self {
        Self::with_merge(|_existing, incoming| incoming)
    }

    pub fn with_merge(merge: impl Fn(&V, V) -> V + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                data: HashMap::new(),
                signal: None,
                alarm: None,
                shutdown: false,
            }),
            cv: Condvar::new(),
            merge: Box::new(merge),
        }
    }

    pub fn attach(&self, signal: &Arc<WakeSignal>) {
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        state.signal = Some(signal.clone());
        if !state.order.is_empty() {
            signal.signal();
        }
    }

    pub fn detach(&self) {
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        state.signal = None;
    }

    /// Push or merge. Returns `true` if the key was newly queued.
    pub fn push(&self, key: K, value: V) -> bool {
        let signal;
        let is_new;
        {
            let mut state = self.state.lock().expect("keyed queue lock poisoned");
            if state.shutdown {
                return false;
            }
            if let Some(existing) = state.data.get(&key) {
                let merged = (self.merge)(existing, value);
                state.data.insert(key, merged);
                is_new = false;
            } else {
                state.order.push_back(key.clone());
                state.data.insert(key, value);
                is_new = true;
            }
            signal = state.signal.clone();
        }
        self.cv.notify_all();
        if let Some(signal) = signal {
            signal.signal();
        }
        is_new
    }

    pub fn try_pop(&self) -> Option<(K, V)> {
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        let key = state.order.pop_front()?;
        let value = state.data.remove(&key)?;
        Some((key, value))
    }

    pub fn drain_all(&self) -> Vec<(K, V)> {
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        let mut out = Vec::with_capacity(state.order.len());
        while let Some(key) = state.order.pop_front() {
            if let Some(value) = state.data.remove(&key) {
                out.push((key, value));
            }
        }
        out
    }

    pub fn drain_up_to(&self, max: usize) -> Vec<(K, V)> {
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        let n = max.min(state.order.len());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(key) = state.order.pop_front() else {
                break;
            };
            if let Some(value) = state.data.remove(&key) {
                out.push((key, value));
            }
        }
        out
    }

    pub fn contains(&self, key: &K) -> bool {
        let state = self.state.lock().expect("keyed queue lock poisoned");
        state.data.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let state = self.state.lock().expect("keyed queue lock poisoned");
        state.data.get(key).cloned()
    }

    pub fn set_alarm(&self, when: Instant) {
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        match state.alarm {
            Some(existing) if existing >= when => {}
            _ => state.alarm = Some(when),
        }
        drop(state);
        self.cv.notify_all();
    }

    pub fn clear_alarm(&self) {
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        state.alarm = None;
    }

    /// Block until an entry is queued, the alarm fires, or shutdown.
    pub fn wait_for_work(&self) -> bool {
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        loop {
            if state.shutdown {
                return false;
            }
            if !state.order.is_empty() {
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
                        .expect("keyed queue lock poisoned");
                    state = next;
                }
                None => {
                    state = self.cv.wait(state).expect("keyed queue lock poisoned");
                }
            }
        }
    }

    pub fn wait_for_work_timeout(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        loop {
            if state.shutdown {
                return false;
            }
            if !state.order.is_empty() {
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
                .expect("keyed queue lock poisoned");
            state = next;
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("keyed queue lock poisoned")
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        let signal;
        {
            let mut state = self.state.lock().expect("keyed queue lock poisoned");
            state.shutdown = true;
            signal = state.signal.clone();
        }
        self.cv.notify_all();
        if let Some(signal) = signal {
            signal.signal();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state
            .lock()
            .expect("keyed queue lock poisoned")
            .shutdown
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("keyed queue lock poisoned");
        state.order.clear();
        state.data.clear();
        state.alarm = None;
    }
}

impl<K: Eq + Hash + Clone, V> Default for KeyedQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
