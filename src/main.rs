//! Headless demo: build a small world, run the session, save, exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use karst::blocks::{BlockDef, BlockTypeRegistry};
use karst::core::{BlockPos, ColumnPos, Rotation};
use karst::mesh::LodRequest;
use karst::runtime::GameCommand;
use karst::{Engine, EngineConfig};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "karst", about = "Headless voxel world core demo")]
struct Args {
    /// World directory (created if missing). Omit to run in memory only.
    #[arg(long)]
    world: Option<PathBuf>,

    /// How many game ticks to run before exiting.
    #[arg(long, default_value_t = 40)]
    ticks: u64,

    /// Radius (in columns) of the demo terrain around the origin.
    #[arg(long, default_value_t = 2)]
    radius: i32,

    /// Seed for the random-tick RNG.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn register_demo_blocks() -> (karst::core::BlockTypeId, karst::core::BlockTypeId) {
    let registry = BlockTypeRegistry::global();
    let defs: karst::blocks::BlocksConfig = demo_block_defs();
    registry.register_all(&defs);
    (
        registry.get_by_name("karst:stone").unwrap().id,
        registry.get_by_name("karst:torch").unwrap().id,
    )
}

fn demo_block_defs() -> karst::blocks::BlocksConfig {
    let mut cfg = karst::blocks::BlocksConfig::default();
    cfg.blocks.push(BlockDef {
        name: "karst:stone".into(),
        solid: Some(true),
        opaque: None,
        blocks_skylight: None,
        light_attenuation: None,
        light_emission: None,
        random_ticks: None,
        tags: vec!["karst:mineral".into()],
    });
    cfg.blocks.push(BlockDef {
        name: "karst:dirt".into(),
        solid: Some(true),
        opaque: None,
        blocks_skylight: None,
        light_attenuation: None,
        light_emission: None,
        random_ticks: Some(true),
        tags: Vec::new(),
    });
    cfg.blocks.push(BlockDef {
        name: "karst:torch".into(),
        solid: Some(false),
        opaque: None,
        blocks_skylight: None,
        light_attenuation: None,
        light_emission: Some(14),
        random_ticks: None,
        tags: Vec::new(),
    });
    cfg
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let (stone, torch) = register_demo_blocks();
    let dirt = BlockTypeRegistry::global()
        .get_by_name("karst:dirt")
        .unwrap()
        .id;

    let engine = Engine::new(EngineConfig {
        world_root: args.world.clone(),
        session: karst::runtime::GameSessionConfig {
            seed: args.seed,
            ..Default::default()
        },
        ..Default::default()
    });

    // Flat terrain: four layers of stone capped with dirt.
    engine.world().set_generator(Some(Arc::new(move |column: &karst::chunk::ChunkColumn| {
        let base = BlockPos::new(column.position().x << 4, 0, column.position().z << 4);
        for z in 0..16 {
            for x in 0..16 {
                for y in 0..4 {
                    column.set_block(BlockPos::new(base.x + x, y, base.z + z), stone);
                }
                column.set_block(BlockPos::new(base.x + x, 4, base.z + z), dirt);
            }
        }
    })));

    let zones = karst::world::DistanceZones::new(args.radius, args.radius, 0);
    for column in zones.columns_to_load(ColumnPos::new(0, 0)) {
        engine.load_column(column);
    }
    engine.world().register_force_loader(BlockPos::new(0, 5, 0), 1);
    engine.light_world();
    engine.start();

    // Drive a few mutations through the game thread.
    engine.session().submit(GameCommand::Place {
        pos: BlockPos::new(0, 5, 0),
        block_type: torch,
        rotation: Rotation::IDENTITY,
    });
    engine.session().submit(GameCommand::Break {
        pos: BlockPos::new(3, 4, 3),
    });

    while engine.session().current_tick() < args.ticks {
        std::thread::sleep(Duration::from_millis(10));
    }

    // Pull one mesh through the cache so the demo exercises the full
    // pipeline, picking the LOD the distance bands would.
    let lod_bands = karst::mesh::LodConfig::new(vec![(4, 0), (8, 1), (16, 2)]);
    let chunk = karst::core::ChunkPos::new(0, 0, 0);
    if let Some(sc) = engine.world().subchunk(chunk) {
        let level = lod_bands.select(chunk.chebyshev_xz(karst::core::ChunkPos::new(0, 0, 0)));
        let result = engine
            .mesh_pool()
            .get_mesh(chunk, &sc, LodRequest::exact(level));
        info!("mesh request triggered rebuild: {}", result.rebuild_triggered);
        std::thread::sleep(Duration::from_millis(100));
        if let Some(mesh) = engine
            .mesh_pool()
            .get_mesh(chunk, &sc, LodRequest::exact(level))
            .pending_mesh
        {
            engine.mesh_pool().mark_uploaded(chunk);
            info!(
                "origin chunk mesh: {} vertices, {} triangles",
                mesh.vertex_count(),
                mesh.triangle_count()
            );
        }
    }

    if args.world.is_some() {
        for z in -args.radius..=args.radius {
            for x in -args.radius..=args.radius {
                engine.release_column(ColumnPos::new(x, z), true);
            }
        }
    }
    engine.stop();

    println!(
        "ran {} ticks over {} columns ({} blocks), {} meshes built",
        engine.session().current_tick(),
        engine.world().column_count(),
        engine.world().total_non_air_blocks(),
        engine
            .mesh_pool()
            .stats()
            .meshes_built
            .load(std::sync::atomic::Ordering::Relaxed)
    );
}
