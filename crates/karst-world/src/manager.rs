//! Column lifecycle: residency, dirty tracking, save queue, unload LRU.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use karst_chunk::ChunkColumn;
use karst_core::ColumnPos;
use karst_queue::LruCache;
use log::debug;

/// Lifecycle state of a managed column.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ColumnState {
    Active,
    SaveQueued,
    Saving,
    UnloadQueued,
}

/// A column plus the bookkeeping the manager needs.
pub struct ManagedColumn {
    pub column: Arc<ChunkColumn>,
    pub state: ColumnState,
    pub dirty: bool,
    pub ref_count: u32,
    pub last_modified: Instant,
    pub last_accessed: Instant,
}

impl ManagedColumn {
    fn new(column: Arc<ChunkColumn>) -> Self {
        let now = Instant::now();
        Self {
            column,
            state: ColumnState::Active,
            dirty: false,
            ref_count: 0,
            last_modified: now,
            last_accessed: now,
        }
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }
}

/// Persistence seam the io crate implements.
///
/// Both callbacks run on IO worker threads; implementations marshal to their
/// own thread as needed.
pub trait ColumnStore: Send + Sync {
    /// Serialize (on the calling thread) and queue a write.
    fn queue_save(
        &self,
        pos: ColumnPos,
        column: Arc<ChunkColumn>,
        done: Box<dyn FnOnce(bool) + Send>,
    );

    /// Queue a read; `done(None)` when the column is absent or corrupt.
    fn request_load(
        &self,
        pos: ColumnPos,
        done: Box<dyn FnOnce(Option<Arc<ChunkColumn>>) + Send>,
    );
}

type CanUnloadFn = Box<dyn Fn(ColumnPos) -> bool + Send + Sync>;
type EvictionFn = Box<dyn Fn(Arc<ChunkColumn>) + Send + Sync>;
type LoadNotifyFn = Box<dyn Fn(ColumnPos) + Send + Sync>;

struct Inner {
    active: HashMap<u64, ManagedColumn>,
    save_queue: VecDeque<u64>,
    saving: HashSet<u64>,
    unload_cache: LruCache<u64, ManagedColumn>,
    last_periodic_save: Instant,
}

/// Column lifecycle state machine.
///
/// `release` drives the transitions: a dirty column goes to the save queue,
/// a clean expired one moves into the unload LRU (unless a force loader or
/// the activity timer vetoes it), everything else stays active.
pub struct ColumnManager {
    inner: Mutex<Inner>,
    config: Mutex<Config>,
    store: Mutex<Option<Arc<dyn ColumnStore>>>,
}

struct Config {
    periodic_save_interval: Duration,
    activity_timeout: Duration,
    can_unload: Option<CanUnloadFn>,
    on_evicted: Option<EvictionFn>,
    on_loaded: Option<LoadNotifyFn>,
}

impl ColumnManager {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                save_queue: VecDeque::new(),
                saving: HashSet::new(),
                unload_cache: LruCache::new(cache_capacity),
                last_periodic_save: Instant::now(),
            }),
            config: Mutex::new(Config {
                periodic_save_interval: Duration::from_secs(60),
                activity_timeout: Duration::from_millis(5000),
                can_unload: None,
                on_evicted: None,
                on_loaded: None,
            }),
            store: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn set_periodic_save_interval(&self, interval: Duration) {
        self.config.lock().expect("manager config poisoned").periodic_save_interval = interval;
    }

    /// Unified activity timeout applied to every column.
    pub fn set_activity_timeout(&self, timeout: Duration) {
        self.config.lock().expect("manager config poisoned").activity_timeout = timeout;
    }

    /// Veto callback consulted before unloading (force loader check).
    pub fn set_can_unload_callback(
        &self,
        callback: impl Fn(ColumnPos) -> bool + Send + Sync + 'static,
    ) {
        self.config.lock().expect("manager config poisoned").can_unload = Some(Box::new(callback));
    }

    /// Receives columns evicted from the unload LRU (typically for a final
    /// save).
    pub fn set_eviction_callback(&self, callback: impl Fn(Arc<ChunkColumn>) + Send + Sync + 'static) {
        self.config.lock().expect("manager config poisoned").on_evicted = Some(Box::new(callback));
    }

    /// Notified after a column is added or loaded.
    pub fn set_load_callback(&self, callback: impl Fn(ColumnPos) + Send + Sync + 'static) {
        self.config.lock().expect("manager config poisoned").on_loaded = Some(Box::new(callback));
    }

    pub fn set_cache_capacity(&self, capacity: usize) {
        let evicted = {
            let mut inner = self.inner.lock().expect("manager lock poisoned");
            inner.unload_cache.set_capacity(capacity)
        };
        self.fire_evictions(evicted.into_iter().map(|(_, m)| m.column));
    }

    pub fn bind_store(&self, store: Arc<dyn ColumnStore>) {
        *self.store.lock().expect("store lock poisoned") = Some(store);
    }

    pub fn unbind_store(&self) {
        *self.store.lock().expect("store lock poisoned") = None;
    }

    // ------------------------------------------------------------------
    // Residency
    // ------------------------------------------------------------------

    /// Fetch a resident column, promoting an unload-queued one back to
    /// active. Returns `None` while the column is being saved: callers must
    /// not load from disk in that window.
    pub fn get(&self, pos: ColumnPos) -> Option<Arc<ChunkColumn>> {
        let key = pos.pack();
        let mut inner = self.inner.lock().expect("manager lock poisoned");
        if inner.saving.contains(&key) {
            return None;
        }
        if let Some(managed) = inner.active.get_mut(&key) {
            managed.touch();
            return Some(managed.column.clone());
        }
        if let Some(mut managed) = inner.unload_cache.remove(&key) {
            managed.state = ColumnState::Active;
            managed.touch();
            let column = managed.column.clone();
            inner.active.insert(key, managed);
            return Some(column);
        }
        None
    }

    /// Take ownership of a new or loaded column.
    pub fn add(&self, column: Arc<ChunkColumn>) {
        let pos = column.position();
        {
            let mut inner = self.inner.lock().expect("manager lock poisoned");
            inner.active.insert(pos.pack(), ManagedColumn::new(column));
        }
        let config = self.config.lock().expect("manager config poisoned");
        if let Some(on_loaded) = &config.on_loaded {
            on_loaded(pos);
        }
    }

    pub fn mark_dirty(&self, pos: ColumnPos) {
        let mut inner = self.inner.lock().expect("manager lock poisoned");
        if let Some(managed) = inner.active.get_mut(&pos.pack()) {
            managed.dirty = true;
            managed.last_modified = Instant::now();
        }
    }

    pub fn add_ref(&self, pos: ColumnPos) {
        let mut inner = self.inner.lock().expect("manager lock poisoned");
        if let Some(managed) = inner.active.get_mut(&pos.pack()) {
            managed.ref_count += 1;
            managed.touch();
        }
    }

    /// Drop a reference. At zero the column transitions: dirty ones queue
    /// for save, clean expired ones move to the unload LRU.
    pub fn release(&self, pos: ColumnPos) {
        let key = pos.pack();
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().expect("manager lock poisoned");
            let Some(managed) = inner.active.get_mut(&key) else {
                return;
            };
            managed.ref_count = managed.ref_count.saturating_sub(1);
            if managed.ref_count > 0 {
                return;
            }
            if managed.dirty {
                self.queue_save_locked(&mut inner, key);
            } else {
                self.try_unload_locked(&mut inner, key, &mut evicted);
            }
        }
        self.fire_evictions(evicted.into_iter());
    }

    pub fn is_saving(&self, pos: ColumnPos) -> bool {
        let inner = self.inner.lock().expect("manager lock poisoned");
        inner.saving.contains(&pos.pack())
    }

    // ------------------------------------------------------------------
    // Save queue
    // ------------------------------------------------------------------

    /// Drain the save queue, marking each column `Saving`. Callers save the
    /// returned columns and report back via `on_save_complete`.
    pub fn take_save_queue(&self) -> Vec<(ColumnPos, Arc<ChunkColumn>)> {
        let mut inner = self.inner.lock().expect("manager lock poisoned");
        let mut out = Vec::new();
        while let Some(key) = inner.save_queue.pop_front() {
            let Some(managed) = inner.active.get_mut(&key) else {
                continue;
            };
            managed.state = ColumnState::Saving;
            let column = managed.column.clone();
            inner.saving.insert(key);
            out.push((ColumnPos::unpack(key), column));
        }
        out
    }

    /// Record a finished save. On success the column is marked clean and,
    /// if unreferenced, becomes eligible for unload.
    pub fn on_save_complete(&self, pos: ColumnPos, success: bool) {
        let key = pos.pack();
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().expect("manager lock poisoned");
            inner.saving.remove(&key);
            let Some(managed) = inner.active.get_mut(&key) else {
                return;
            };
            if success {
                managed.dirty = false;
            }
            managed.state = ColumnState::Active;
            if managed.ref_count == 0 {
                if managed.dirty {
                    self.queue_save_locked(&mut inner, key);
                } else {
                    self.try_unload_locked(&mut inner, key, &mut evicted);
                }
            }
        }
        self.fire_evictions(evicted.into_iter());
    }

    /// Periodic maintenance: queue dirty active columns for save on the
    /// configured interval.
    pub fn tick(&self) {
        let interval = self
            .config
            .lock()
            .expect("manager config poisoned")
            .periodic_save_interval;
        let mut inner = self.inner.lock().expect("manager lock poisoned");
        if inner.last_periodic_save.elapsed() < interval {
            return;
        }
        inner.last_periodic_save = Instant::now();
        let keys: Vec<u64> = inner
            .active
            .iter()
            .filter(|(_, m)| m.dirty && m.state == ColumnState::Active)
            .map(|(&k, _)| k)
            .collect();
        for key in keys {
            self.queue_save_locked(&mut inner, key);
        }
    }

    /// Every dirty column, for shutdown flushes.
    pub fn all_dirty(&self) -> Vec<(ColumnPos, Arc<ChunkColumn>)> {
        let inner = self.inner.lock().expect("manager lock poisoned");
        inner
            .active
            .iter()
            .filter(|(_, m)| m.dirty)
            .map(|(&k, m)| (ColumnPos::unpack(k), m.column.clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Store binding
    // ------------------------------------------------------------------

    fn store(&self) -> Option<Arc<dyn ColumnStore>> {
        self.store.lock().expect("store lock poisoned").clone()
    }

    /// Push queued saves through the bound store.
    pub fn process_save_queue(self: &Arc<Self>) {
        let Some(store) = self.store() else {
            return;
        };
        for (pos, column) in self.take_save_queue() {
            let manager = Arc::clone(self);
            store.queue_save(
                pos,
                column,
                Box::new(move |success| manager.on_save_complete(pos, success)),
            );
        }
    }

    /// Async load through the bound store. Returns `false` with no store
    /// bound or while the column is being saved.
    pub fn request_load(
        self: &Arc<Self>,
        pos: ColumnPos,
        done: impl FnOnce(Option<Arc<ChunkColumn>>) + Send + 'static,
    ) -> bool {
        if self.is_saving(pos) {
            return false;
        }
        let Some(store) = self.store() else {
            return false;
        };
        let manager = Arc::clone(self);
        store.request_load(
            pos,
            Box::new(move |column| {
                if let Some(column) = &column {
                    manager.add(column.clone());
                }
                done(column);
            }),
        );
        true
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("manager lock poisoned").active.len()
    }

    pub fn save_queue_len(&self) -> usize {
        self.inner
            .lock()
            .expect("manager lock poisoned")
            .save_queue
            .len()
    }

    pub fn cache_len(&self) -> usize {
        self.inner
            .lock()
            .expect("manager lock poisoned")
            .unload_cache
            .len()
    }

    pub fn state_of(&self, pos: ColumnPos) -> Option<ColumnState> {
        let inner = self.inner.lock().expect("manager lock poisoned");
        let key = pos.pack();
        if let Some(managed) = inner.active.get(&key) {
            return Some(managed.state);
        }
        inner.unload_cache.peek(&key).map(|m| m.state)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn queue_save_locked(&self, inner: &mut Inner, key: u64) {
        if let Some(managed) = inner.active.get_mut(&key) {
            if managed.state != ColumnState::SaveQueued {
                managed.state = ColumnState::SaveQueued;
                inner.save_queue.push_back(key);
            }
        }
    }

    fn try_unload_locked(
        &self,
        inner: &mut Inner,
        key: u64,
        evicted: &mut Vec<Arc<ChunkColumn>>,
    ) {
        let pos = ColumnPos::unpack(key);
        let config = self.config.lock().expect("manager config poisoned");
        let Some(managed) = inner.active.get(&key) else {
            return;
        };
        // Recent cross-chunk activity keeps the column resident so
        // propagation chains are not interrupted.
        if !managed.column.activity_expired(config.activity_timeout) {
            return;
        }
        if let Some(can_unload) = &config.can_unload {
            if !can_unload(pos) {
                return;
            }
        }
        drop(config);
        let Some(mut managed) = inner.active.remove(&key) else {
            return;
        };
        managed.state = ColumnState::UnloadQueued;
        debug!("column {pos:?} moved to unload cache");
        if let Some((_, old)) = inner.unload_cache.put(key, managed) {
            evicted.push(old.column);
        }
    }

    fn fire_evictions(&self, evicted: impl Iterator<Item = Arc<ChunkColumn>>) {
        let config = self.config.lock().expect("manager config poisoned");
        if let Some(on_evicted) = &config.on_evicted {
            for column in evicted {
                on_evicted(column);
            }
        }
    }
}
