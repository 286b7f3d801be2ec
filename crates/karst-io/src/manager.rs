//! Async save/load workers over region files.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use karst_chunk::ChunkColumn;
use karst_core::ColumnPos;
use karst_queue::{LruCache, Queue};
use karst_world::ColumnStore;
use log::{debug, warn};

use crate::codec::{column_from_cbor, column_to_cbor};
use crate::region::{RegionFile, RegionPos};

type LoadDone = Box<dyn FnOnce(Option<Arc<ChunkColumn>>) + Send>;
type SaveDone = Box<dyn FnOnce(bool) + Send>;

struct LoadRequest {
    pos: ColumnPos,
    done: LoadDone,
}

struct SaveRequest {
    pos: ColumnPos,
    // Serialized on the requesting thread so no column lock is held while
    // the worker owns the bytes.
    cbor: Vec<u8>,
    done: Option<SaveDone>,
}

struct RegionCache {
    dir: PathBuf,
    open: LruCache<(i32, i32), Arc<Mutex<RegionFile>>>,
}

impl RegionCache {
    fn region(&mut self, pos: RegionPos) -> Option<Arc<Mutex<RegionFile>>> {
        if let Some(region) = self.open.get(&(pos.rx, pos.rz)) {
            return Some(region.clone());
        }
        match RegionFile::open(&self.dir, pos) {
            Ok(region) => {
                let region = Arc::new(Mutex::new(region));
                self.open.put((pos.rx, pos.rz), region.clone());
                Some(region)
            }
            Err(err) => {
                warn!("cannot open region r.{}.{}: {err}", pos.rx, pos.rz);
                None
            }
        }
    }
}

/// Owns one loader thread and one saver thread, each on a
/// condition-variable-signaled queue, plus a bounded cache of open region
/// files (default 16).
///
/// Callbacks run on the IO worker threads; callers marshal to their own
/// thread as needed.
pub struct IoManager {
    load_queue: Arc<Queue<LoadRequest>>,
    save_queue: Arc<Queue<SaveRequest>>,
    regions: Arc<Mutex<RegionCache>>,
    running: Arc<AtomicBool>,
    pending_saves: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoManager {
    /// `dir` is the per-dimension regions directory
    /// (`<world_root>/regions/<dim>`).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            load_queue: Arc::new(Queue::new()),
            save_queue: Arc::new(Queue::new()),
            regions: Arc::new(Mutex::new(RegionCache {
                dir: dir.into(),
                open: LruCache::new(16),
            })),
            running: Arc::new(AtomicBool::new(false)),
            pending_saves: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_max_open_regions(&self, count: usize) {
        let mut cache = self.regions.lock().expect("region cache lock poisoned");
        cache.open.set_capacity(count);
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().expect("io workers lock poisoned");

        let load_queue = self.load_queue.clone();
        let regions = self.regions.clone();
        let running = self.running.clone();
        workers.push(
            std::thread::Builder::new()
                .name("karst-io-load".into())
                .spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        if !load_queue.wait_for_work() {
                            break;
                        }
                        while let Some(request) = load_queue.try_pop() {
                            Self::run_load(&regions, request);
                        }
                    }
                })
                .expect("failed to spawn io load worker"),
        );

        let save_queue = self.save_queue.clone();
        let regions = self.regions.clone();
        let running = self.running.clone();
        let pending = self.pending_saves.clone();
        workers.push(
            std::thread::Builder::new()
                .name("karst-io-save".into())
                .spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        if !save_queue.wait_for_work() {
                            break;
                        }
                        while let Some(request) = save_queue.try_pop() {
                            Self::run_save(&regions, request);
                            pending.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    // Drain what was queued before shutdown so a final
                    // flush is not lost.
                    while let Some(request) = save_queue.try_pop() {
                        Self::run_save(&regions, request);
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                })
                .expect("failed to spawn io save worker"),
        );
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.load_queue.shutdown();
        self.save_queue.shutdown();
        let mut workers = self.workers.lock().expect("io workers lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Serialize `column` on this thread and queue the write.
    pub fn queue_save_with(
        &self,
        pos: ColumnPos,
        column: &ChunkColumn,
        done: Option<SaveDone>,
    ) {
        let cbor = column_to_cbor(column);
        self.pending_saves.fetch_add(1, Ordering::SeqCst);
        if !self.save_queue.push(SaveRequest { pos, cbor, done }) {
            // Shut down: the request was dropped.
            self.pending_saves.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Queue a read; the callback receives `None` for absent or corrupt
    /// columns. Dropped silently after shutdown.
    pub fn request_load_with(&self, pos: ColumnPos, done: LoadDone) {
        let _ = self.load_queue.push(LoadRequest { pos, done });
    }

    /// Block until every queued save has hit its region file.
    pub fn flush(&self) {
        while self.pending_saves.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn pending_save_count(&self) -> usize {
        self.pending_saves.load(Ordering::SeqCst)
    }

    pub fn pending_load_count(&self) -> usize {
        self.load_queue.len()
    }

    pub fn open_region_count(&self) -> usize {
        self.regions.lock().expect("region cache lock poisoned").open.len()
    }

    fn run_load(regions: &Arc<Mutex<RegionCache>>, request: LoadRequest) {
        let region_pos = RegionPos::from_column(request.pos);
        let region = {
            let mut cache = regions.lock().expect("region cache lock poisoned");
            cache.region(region_pos)
        };
        let Some(region) = region else {
            (request.done)(None);
            return;
        };
        let bytes = {
            let mut region = region.lock().expect("region lock poisoned");
            region.load_column_raw(request.pos)
        };
        let column = match bytes {
            Ok(Some(bytes)) => match column_from_cbor(&bytes) {
                Ok(column) => Some(column),
                Err(err) => {
                    // Corrupt chunk: treated as absent for loads.
                    warn!("corrupt column at {:?}: {err}", request.pos);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("load failed at {:?}: {err}", request.pos);
                None
            }
        };
        (request.done)(column);
    }

    fn run_save(regions: &Arc<Mutex<RegionCache>>, request: SaveRequest) {
        let region_pos = RegionPos::from_column(request.pos);
        let region = {
            let mut cache = regions.lock().expect("region cache lock poisoned");
            cache.region(region_pos)
        };
        let success = match region {
            Some(region) => {
                let mut region = region.lock().expect("region lock poisoned");
                // One retry on IO failure before reporting.
                match region.save_column_raw(request.pos, &request.cbor) {
                    Ok(()) => true,
                    Err(first) => {
                        warn!("save failed at {:?}, retrying: {first}", request.pos);
                        region.save_column_raw(request.pos, &request.cbor).is_ok()
                    }
                }
            }
            None => false,
        };
        if success {
            debug!("saved column {:?}", request.pos);
        }
        if let Some(done) = request.done {
            done(success);
        }
    }
}

impl ColumnStore for IoManager {
    fn queue_save(
        &self,
        pos: ColumnPos,
        column: Arc<ChunkColumn>,
        done: Box<dyn FnOnce(bool) + Send>,
    ) {
        self.queue_save_with(pos, &column, Some(done));
    }

    fn request_load(
        &self,
        pos: ColumnPos,
        done: Box<dyn FnOnce(Option<Arc<ChunkColumn>>) + Send>,
    ) {
        self.request_load_with(pos, done);
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.stop();
    }
}
