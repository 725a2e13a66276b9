mod demo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use liveworld_common::MapId;
use liveworld_kernel::World;
use liveworld_persist::{
    BlobStore, FileBlobStore, LOG_SCHEMA_VERSION, META_KEY, SNAPSHOT_SCHEMA_VERSION,
    SnapshotManager,
};
use liveworld_server::EngineConfig;
use liveworld_tools::WorldInspector;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "liveworld", about = "Operator tool for liveworld world stores")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version, storage schemas and the default engine configuration
    Info,
    /// Summarise the latest snapshot and log of a store
    Inspect {
        /// Directory of the world store
        store: PathBuf,
        /// Draw this map and list its entities
        #[arg(short, long)]
        map: Option<u64>,
    },
    /// Check snapshots and log segments for damage
    Verify {
        /// Directory of the world store
        store: PathBuf,
    },
    /// Run an editor and a player against an in-memory world and print what they receive
    Demo {
        /// Print every delta, not only frame headers
        #[arg(short, long)]
        deltas: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => info()?,
        Commands::Inspect { store, map } => inspect(&store, map.map(MapId))?,
        Commands::Verify { store } => verify(&store)?,
        Commands::Demo { deltas } => demo::run(deltas)?,
    }

    Ok(())
}

fn info() -> anyhow::Result<()> {
    println!("liveworld v{}", env!("CARGO_PKG_VERSION"));
    println!("snapshot schema: v{SNAPSHOT_SCHEMA_VERSION}");
    println!("log schema: v{LOG_SCHEMA_VERSION}");
    println!();
    println!("# default engine configuration");
    print!("{}", toml::to_string(&EngineConfig::default())?);
    Ok(())
}

fn open_store(path: &Path) -> anyhow::Result<SnapshotManager> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    let blobs: Arc<dyn BlobStore> = Arc::new(
        FileBlobStore::open(path).with_context(|| format!("opening {}", path.display()))?,
    );
    if blobs.get(META_KEY)?.is_none() {
        bail!("{} is not a liveworld store (no {META_KEY})", path.display());
    }
    Ok(SnapshotManager::open(blobs)?)
}

fn inspect(path: &Path, map: Option<MapId>) -> anyhow::Result<()> {
    let manager = open_store(path)?;
    let summary = manager.summary()?;
    let meta = &summary.meta;
    println!(
        "world {} (world schema v{}, log schema v{})",
        meta.world_id, meta.world_schema_version, meta.log_schema_version
    );
    println!("active segment: {}", meta.active_segment);

    println!("snapshots:");
    for (key, header) in &summary.snapshots {
        match header {
            Ok(h) => println!(
                "  {key} commit={} next_entity={} hash={:#018x} bytes={}",
                h.commit, h.next_entity, h.state_hash, h.payload_len
            ),
            Err(reason) => println!("  {key} UNREADABLE: {reason}"),
        }
    }
    println!("log segments:");
    for segment in &summary.segments {
        let range = match (segment.first_commit, segment.last_commit) {
            (Some(first), Some(last)) => format!("commits {first}..={last}"),
            _ => "empty".to_string(),
        };
        print!("  {} records={} {range}", segment.key, segment.records);
        match &segment.damage {
            Some(stop) => println!(" DAMAGED at byte {}: {}", stop.offset, stop.reason),
            None => println!(),
        }
    }

    let (world, commit) = rebuild(&manager)?;
    println!();
    println!("state at commit {commit}");
    println!("{}", WorldInspector::summary(&world));
    for id in world.map_ids() {
        if let Some(info) = WorldInspector::inspect_map(&world, id) {
            println!("  {info}");
        }
    }

    if let Some(id) = map {
        let Some(state) = world.map(id) else {
            bail!("{id} does not exist at commit {commit}");
        };
        println!();
        print!("{}", WorldInspector::render_map(state));
        for entity in WorldInspector::list_entities(&world, Some(id)) {
            if let Some(info) = WorldInspector::inspect_entity(&world, entity) {
                println!("  {info}");
            }
        }
    }
    Ok(())
}

/// The latest snapshot with the valid log prefix applied on top.
fn rebuild(manager: &SnapshotManager) -> anyhow::Result<(World, u64)> {
    let (mut world, mut commit) = match manager.load_latest()? {
        Some(snapshot) => (snapshot.world, snapshot.commit),
        None => (World::new(), 0),
    };
    let tail = manager.read_log(commit)?;
    if let Some(stop) = &tail.damage {
        warn!(segment = %stop.segment, offset = stop.offset, reason = %stop.reason, "log damaged");
    }
    for record in &tail.records {
        if let Err(err) = world.apply(&record.command) {
            warn!(commit = record.commit, %err, "logged command does not replay; stopping");
            break;
        }
        commit = record.commit;
    }
    if let Err(err) = world.check_consistency(None) {
        warn!(%err, "rebuilt world is inconsistent");
    }
    Ok((world, commit))
}

fn verify(path: &Path) -> anyhow::Result<()> {
    let manager = open_store(path)?;
    let problems = manager.verify()?;
    if problems.is_empty() {
        println!("{}: ok", path.display());
        return Ok(());
    }
    for problem in &problems {
        println!("{problem}");
    }
    bail!("{} problem(s) found in {}", problems.len(), path.display());
}
