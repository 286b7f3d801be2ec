//! Dedicated light worker thread.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use karst_core::ChunkPos;
use karst_queue::Queue;
use karst_world::{LightingUpdate, MeshRebuildRequest, World};
use log::debug;

use crate::propagate::apply_update;

/// Async light engine: one worker blocked on its own queue.
///
/// The game thread enqueues updates; the worker propagates and, for updates
/// flagged `trigger_mesh_rebuild`, pushes the touched subchunks onto the
/// world's mesh rebuild queue after propagation completes. That ordering is
/// what keeps meshes from being built against pre-propagation light.
pub struct LightEngine {
    world: Arc<World>,
    queue: Arc<Queue<LightingUpdate>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LightEngine {
    pub fn new(world: Arc<World>) -> Self {
        Self {
            world,
            queue: Arc::new(Queue::new()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// The queue the world should be bound to via
    /// [`World::set_lighting_queue`].
    pub fn queue(&self) -> Arc<Queue<LightingUpdate>> {
        self.queue.clone()
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let world = self.world.clone();
        let queue = self.queue.clone();
        let running = self.running.clone();
        let handle = std::thread::Builder::new()
            .name("karst-light".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if !queue.wait_for_work() {
                        break;
                    }
                    let batch = queue.drain_all();
                    if batch.is_empty() {
                        continue;
                    }
                    Self::process_batch(&world, &batch);
                }
            })
            .expect("failed to spawn light worker");
        *self.worker.lock().expect("light worker lock poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.shutdown();
        if let Some(handle) = self
            .worker
            .lock()
            .expect("light worker lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Synchronous processing for immediate visual feedback (and tests):
    /// runs one update inline on the calling thread.
    pub fn process_now(&self, update: &LightingUpdate) {
        Self::process_batch(&self.world, std::slice::from_ref(update));
    }

    fn process_batch(world: &World, batch: &[LightingUpdate]) {
        let mut rebuild: HashSet<ChunkPos> = HashSet::new();
        for update in batch {
            let touched = apply_update(world, update);
            if update.trigger_mesh_rebuild {
                rebuild.extend(touched.iter().copied());
                // The mutation's own subchunks rebuild even when light was
                // already correct.
                for chunk in World::affected_subchunks(update.pos) {
                    rebuild.insert(chunk);
                }
            }
        }
        if rebuild.is_empty() {
            return;
        }
        let Some(mesh_queue) = world.mesh_queue() else {
            return;
        };
        debug!("light pass invalidated {} subchunks", rebuild.len());
        for chunk in rebuild {
            let (block_version, light_version) = match world.subchunk(chunk) {
                Some(sc) => (sc.block_version(), sc.light_version()),
                None => (0, 0),
            };
            mesh_queue.push(chunk, MeshRebuildRequest::urgent(block_version, light_version));
        }
    }
}

impl Drop for LightEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
