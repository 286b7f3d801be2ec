//! Top-level wiring of world, workers and persistence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use karst_core::ColumnPos;
use karst_io::IoManager;
use karst_lighting::{LightEngine, initialize_column_light, initialize_world_light};
use karst_runtime::{GameSession, GameSessionConfig, MeshWorkerPool};
use karst_world::{ColumnManager, MeshRebuildQueue, World, new_mesh_rebuild_queue};
use log::info;

/// Construction parameters for an [`Engine`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// World directory; `None` runs without persistence.
    pub world_root: Option<PathBuf>,
    pub dimension: String,
    /// Mesh worker threads; 0 = hardware concurrency - 1.
    pub mesh_threads: usize,
    pub unload_cache_capacity: usize,
    pub activity_timeout: Duration,
    pub periodic_save_interval: Duration,
    pub session: GameSessionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            world_root: None,
            dimension: "overworld".to_string(),
            mesh_threads: 0,
            unload_cache_capacity: 64,
            activity_timeout: Duration::from_millis(5000),
            periodic_save_interval: Duration::from_secs(60),
            session: GameSessionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read `<root>/config.yaml`, falling back to defaults for missing
    /// keys. A missing file yields the defaults with persistence enabled.
    pub fn load(root: impl Into<PathBuf>) -> EngineConfig {
        let root = root.into();
        let mut config = EngineConfig {
            world_root: Some(root.clone()),
            ..EngineConfig::default()
        };
        let Ok(file) = karst_io::ConfigFile::load(root.join("config.yaml")) else {
            return config;
        };
        if let Some(dimension) = file.get("dimension") {
            config.dimension = dimension.to_string();
        }
        if let Some(threads) = file.get_int("mesh_threads") {
            config.mesh_threads = threads.max(0) as usize;
        }
        if let Some(capacity) = file.get_int("unload_cache_capacity") {
            config.unload_cache_capacity = capacity.max(1) as usize;
        }
        if let Some(timeout) = file.get_int("activity_timeout_ms") {
            config.activity_timeout = Duration::from_millis(timeout.max(0) as u64);
        }
        if let Some(interval) = file.get_int("periodic_save_secs") {
            config.periodic_save_interval = Duration::from_secs(interval.max(0) as u64);
        }
        if let Some(rate) = file.get_int("tick_rate") {
            config.session.tick_rate = rate.max(1) as f32;
        }
        if let Some(budget) = file.get_int("random_ticks_per_chunk") {
            config.session.random_ticks_per_chunk = budget.max(0) as u32;
        }
        if let Some(seed) = file.get_int("seed") {
            config.session.seed = seed as u64;
        }
        config
    }
}

/// Owns the long-lived threads of one running world.
///
/// Teardown order matters: the game thread joins first (it is the only
/// mutation authority), then light and mesh workers, then dirty columns are
/// flushed through IO before its threads join. The world outlives them all
/// and drops with the engine.
pub struct Engine {
    world: Arc<World>,
    session: Arc<GameSession>,
    light: Arc<LightEngine>,
    mesh_queue: Arc<MeshRebuildQueue>,
    mesh_pool: Arc<MeshWorkerPool>,
    columns: Arc<ColumnManager>,
    io: Option<Arc<IoManager>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Engine {
        let world = Arc::new(World::new());

        let mesh_queue = Arc::new(new_mesh_rebuild_queue());
        world.set_mesh_queue(Some(mesh_queue.clone()));

        let light = Arc::new(LightEngine::new(world.clone()));
        world.set_lighting_queue(Some(light.queue()));

        let mesh_pool = MeshWorkerPool::new(world.clone(), mesh_queue.clone(), config.mesh_threads);

        let columns = Arc::new(ColumnManager::new(config.unload_cache_capacity));
        columns.set_activity_timeout(config.activity_timeout);
        columns.set_periodic_save_interval(config.periodic_save_interval);
        {
            let world = world.clone();
            columns.set_can_unload_callback(move |pos| world.can_unload_column(pos));
        }

        let io = config.world_root.as_ref().map(|root| {
            let io = Arc::new(IoManager::new(
                root.join("regions").join(&config.dimension),
            ));
            // IO workers come up with the engine so loads work before
            // start().
            io.start();
            columns.bind_store(io.clone());
            // Evicted columns get a final save.
            let sink = io.clone();
            columns.set_eviction_callback(move |column| {
                sink.queue_save_with(column.position(), &column, None);
            });
            io
        });

        let session = GameSession::new(world.clone(), config.session);

        Engine {
            world,
            session,
            light,
            mesh_queue,
            mesh_pool,
            columns,
            io,
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.light.start();
        self.mesh_pool.start();
        self.session.start();
        info!("engine started ({} mesh workers)", self.mesh_pool.thread_count());
    }

    /// Two-phase stop: join every consumer, then flush dirty columns.
    /// Idempotent; the drop glue calls it too.
    pub fn stop(&self) {
        if self.stopped.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.session.stop();
        self.light.stop();
        self.mesh_pool.stop();
        if let Some(io) = &self.io {
            self.columns.process_save_queue();
            for (pos, column) in self.columns.all_dirty() {
                io.queue_save_with(pos, &column, None);
            }
            io.flush();
            io.stop();
        }
        info!("engine stopped");
    }

    /// Make a column resident: manager first, then disk, then the world
    /// generator. The column joins the world table and gets an initial
    /// light pass.
    pub fn load_column(&self, pos: ColumnPos) -> Arc<karst_chunk::ChunkColumn> {
        if let Some(column) = self.columns.get(pos) {
            self.world.insert_column(column.clone());
            return column;
        }
        if self.io.is_some() {
            let (tx, rx) = std::sync::mpsc::channel();
            let requested = self.columns.request_load(pos, move |column| {
                let _ = tx.send(column);
            });
            if requested {
                if let Ok(Some(column)) = rx.recv() {
                    self.world.insert_column(column.clone());
                    initialize_column_light(&self.world, &column);
                    return column;
                }
            }
        }
        let column = self.world.get_or_create_column(pos);
        self.columns.add(column.clone());
        initialize_column_light(&self.world, &column);
        column
    }

    /// Mark a column dirty and drop a residency reference, then pump the
    /// lifecycle machinery (periodic saves plus the save queue).
    pub fn release_column(&self, pos: ColumnPos, dirty: bool) {
        if dirty {
            self.columns.mark_dirty(pos);
        }
        self.columns.release(pos);
        self.columns.tick();
        self.columns.process_save_queue();
    }

    /// Run the initial lighting pass over everything currently loaded.
    pub fn light_world(&self) {
        initialize_world_light(&self.world);
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub fn session(&self) -> &Arc<GameSession> {
        &self.session
    }

    pub fn mesh_pool(&self) -> &Arc<MeshWorkerPool> {
        &self.mesh_pool
    }

    pub fn mesh_queue(&self) -> &Arc<MeshRebuildQueue> {
        &self.mesh_queue
    }

    pub fn column_manager(&self) -> &Arc<ColumnManager> {
        &self.columns
    }

    pub fn io(&self) -> Option<&Arc<IoManager>> {
        self.io.as_ref()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_blocks::{BlockDef, BlockTypeRegistry};
    use karst_chunk::ChunkColumn;
    use karst_core::{BlockPos, BlockTypeId};
    use std::time::Instant;

    fn register(name: &str) -> BlockTypeId {
        BlockTypeRegistry::global().register(&BlockDef {
            name: name.to_string(),
            solid: Some(true),
            opaque: None,
            blocks_skylight: None,
            light_attenuation: None,
            light_emission: None,
            random_ticks: None,
            tags: Vec::new(),
        })
    }

    fn engine_for(root: &std::path::Path) -> Engine {
        Engine::new(EngineConfig {
            world_root: Some(root.to_path_buf()),
            mesh_threads: 1,
            session: GameSessionConfig {
                tick_rate: 100.0,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn world_survives_engine_restart() {
        let dir = tempfile::tempdir().unwrap();
        let stone = register("karst:e2e_stone");
        let marker = register("karst:e2e_marker");
        let pos = ColumnPos::new(0, 0);

        {
            let engine = engine_for(dir.path());
            engine.load_column(pos);
            engine.world().set_block(BlockPos::new(3, 10, 3), stone);
            engine.world().set_block(BlockPos::new(12, 90, 12), marker);
            engine.release_column(pos, true);
            engine.stop();
        }

        let engine = engine_for(dir.path());
        let column = engine.load_column(pos);
        assert_eq!(column.get_block(BlockPos::new(3, 10, 3)), stone);
        assert_eq!(column.get_block(BlockPos::new(12, 90, 12)), marker);
        assert_eq!(column.non_air_count(), 2);
        engine.stop();
    }

    #[test]
    fn game_thread_applies_external_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let stone = register("karst:e2e_place_stone");
        let engine = engine_for(dir.path());
        engine.load_column(ColumnPos::new(0, 0));
        engine.start();

        let target = BlockPos::new(5, 20, 5);
        assert!(engine.world().place_block(target, stone));
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.world().get_block(target) != stone {
            assert!(Instant::now() < deadline, "placement never applied");
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.stop();
    }

    #[test]
    fn generator_feeds_new_columns() {
        let engine = Engine::new(EngineConfig::default());
        let filler = register("karst:e2e_fill");
        engine
            .world()
            .set_generator(Some(Arc::new(move |column: &ChunkColumn| {
                let base = BlockPos::new(column.position().x << 4, 0, column.position().z << 4);
                column.set_block(base, filler);
            })));
        let column = engine.load_column(ColumnPos::new(4, 4));
        assert_eq!(column.non_air_count(), 1);
        assert!(column.is_light_initialized());
        engine.stop();
    }

    #[test]
    fn force_loaded_column_stays_resident() {
        let engine = Engine::new(EngineConfig {
            activity_timeout: Duration::ZERO,
            ..Default::default()
        });
        let pos = ColumnPos::new(1, 1);
        engine.load_column(pos);
        engine
            .world()
            .register_force_loader(BlockPos::new(24, 10, 24), 0);
        engine.release_column(pos, false);
        // The manager keeps it active: force loader vetoed the unload.
        assert_eq!(engine.column_manager().active_count(), 1);
        assert_eq!(engine.column_manager().cache_len(), 0);
        engine.stop();
    }

    #[test]
    fn engine_config_reads_world_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "# demo world\nseed: 0x2A\ntick_rate: 40\ndimension: karst_depths\nactivity_timeout_ms: 250\n",
        )
        .unwrap();
        let config = EngineConfig::load(dir.path());
        assert_eq!(config.session.seed, 42);
        assert_eq!(config.session.tick_rate, 40.0);
        assert_eq!(config.dimension, "karst_depths");
        assert_eq!(config.activity_timeout, Duration::from_millis(250));
        // Unset keys keep their defaults.
        assert_eq!(config.unload_cache_capacity, 64);
    }
}
