//! An editor and a player sharing one world, with every frame they receive printed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use glam::IVec2;
use liveworld_broadcast::{Frame, RecordingTransport};
use liveworld_common::{Direction, MapId, Privilege, SessionId, TileCoord};
use liveworld_kernel::{
    ActionOp, ChatChannel, CommandKind, Delta, DeltaKind, EdgeLinks, EditOp, MapSettings,
    ScriptOp, Terrain, TilePatch,
};
use liveworld_persist::MemoryBlobStore;
use liveworld_script::{ScriptContext, ScriptHooks};
use liveworld_server::{Engine, EngineConfig, EngineIo, StaticDirectory};
use liveworld_tools::WorldInspector;

const EDITOR: SessionId = SessionId(1);
const PLAYER: SessionId = SessionId(2);

/// Greets every avatar that enters a map.
struct Greeter;

impl ScriptHooks for Greeter {
    fn on_delta_applied(&mut self, delta: &Delta, ctx: &mut ScriptContext) {
        if let DeltaKind::EntityCreated { entity } = &delta.kind
            && entity.is_player()
        {
            ctx.enqueue(ScriptOp::Announce {
                map: delta.scope,
                text: format!("welcome, {}", entity.name()),
            });
        }
    }
}

pub fn run(show_deltas: bool) -> anyhow::Result<()> {
    let transport = Arc::new(RecordingTransport::new());
    let directory = StaticDirectory::new()
        .with(EDITOR, "ada", Privilege::Editor)
        .with(PLAYER, "cy", Privilege::Player);
    let mut config = EngineConfig::default();
    config.gameplay.start_position = [1, 1];
    let engine = Engine::start(
        config,
        EngineIo {
            transport: transport.clone(),
            directory: Arc::new(directory),
            store: Some(Arc::new(MemoryBlobStore::new())),
        },
        Greeter,
    )?;

    engine.submit_system(EditOp::CreateMap {
        map: MapId(1),
        width: 12,
        height: 6,
        settings: MapSettings {
            name: "harbour".into(),
            edges: EdgeLinks {
                east: Some(MapId(2)),
                ..EdgeLinks::default()
            },
            ..MapSettings::default()
        },
    })?;
    engine.submit_system(EditOp::CreateMap {
        map: MapId(2),
        width: 8,
        height: 6,
        settings: MapSettings {
            name: "lighthouse".into(),
            ..MapSettings::default()
        },
    })?;
    settle(&engine)?;

    engine.connect(EDITOR)?;
    engine.connect(PLAYER)?;
    settle(&engine)?;

    for x in 0..12 {
        engine.submit(
            EDITOR,
            CommandKind::Edit(EditOp::SetTile {
                map: MapId(1),
                at: TileCoord::new(x, 4),
                patch: TilePatch::terrain(Terrain::Water),
            }),
        )?;
    }
    engine.submit(
        EDITOR,
        CommandKind::Edit(EditOp::SpawnItem {
            map: MapId(1),
            id: None,
            position: IVec2::new(6, 2),
            kind: "lantern".into(),
            quantity: 1,
        }),
    )?;
    for x in 2..=8 {
        engine.submit(
            PLAYER,
            CommandKind::Action(ActionOp::Move {
                to: IVec2::new(x, 1),
                facing: Direction::East,
            }),
        )?;
    }
    engine.submit(
        PLAYER,
        CommandKind::Action(ActionOp::Say {
            text: "is that a lantern?".into(),
        }),
    )?;
    engine.submit(
        PLAYER,
        CommandKind::Action(ActionOp::Shout {
            text: "anyone at the lighthouse?".into(),
        }),
    )?;
    // The editor gets the map list; players may not open the editor.
    engine.submit(EDITOR, CommandKind::Action(ActionOp::SetEditorMode { open: true }))?;
    engine.submit(PLAYER, CommandKind::Action(ActionOp::SetEditorMode { open: true }))?;
    settle(&engine)?;

    for (session, name) in [(EDITOR, "ada"), (PLAYER, "cy")] {
        println!("== frames for {name} ({session})");
        for frame in transport.frames_for(session) {
            print_frame(&frame, show_deltas)?;
        }
        println!();
    }

    let world = engine.capture().world;
    println!("{}", WorldInspector::summary(&world));
    if let Some(map) = world.map(MapId(1)) {
        print!("{}", WorldInspector::render_map(map));
    }

    engine.shutdown()?;
    Ok(())
}

fn settle(engine: &Engine) -> anyhow::Result<()> {
    if !engine.quiesce(Duration::from_secs(5)) {
        bail!("engine did not settle");
    }
    Ok(())
}

fn print_frame(frame: &Frame, show_deltas: bool) -> anyhow::Result<()> {
    let deltas = frame.decode()?;
    println!(
        "  {} rev={} commit={} {:?} deltas={}",
        frame.scope,
        frame.revision,
        frame.commit,
        frame.class,
        deltas.len()
    );
    if show_deltas {
        for delta in &deltas {
            println!("    {}", describe(delta));
        }
    }
    Ok(())
}

fn describe(delta: &Delta) -> String {
    match &delta.kind {
        DeltaKind::MapCreated { summary } => format!("map created {}x{}", summary.width, summary.height),
        DeltaKind::MapRemoved => "map removed".into(),
        DeltaKind::MapSettingsChanged { version, .. } => format!("settings now {version}"),
        DeltaKind::MapReplaced { state } => {
            format!("map replaced {}x{} at {}", state.width, state.height, state.version)
        }
        DeltaKind::MapList { maps } => format!("{} maps listed", maps.len()),
        DeltaKind::TileChanged { at, tile } => format!("tile {at} -> {:?}", tile.terrain),
        DeltaKind::EntityCreated { entity } => {
            format!("{} {:?} appears at {}", entity.id, entity.name(), entity.position)
        }
        DeltaKind::EntityRemoved { id, reason, .. } => format!("{id} removed ({reason:?})"),
        DeltaKind::EntityMoved { id, position, .. } => format!("{id} moves to {position}"),
        DeltaKind::AttributeChanged { id, key, .. } => format!("{id} attribute {key}"),
        DeltaKind::ItemHeld { item, holder, .. } => match holder {
            Some(holder) => format!("{item} held by {holder}"),
            None => format!("{item} dropped"),
        },
        DeltaKind::FlagsChanged { id, flags, .. } => format!("{id} flags {flags:?}"),
        DeltaKind::TriggerFired { entity, tag } => format!("{entity} fired {tag}"),
        DeltaKind::Chat {
            channel: ChatChannel::Server,
            text,
            ..
        } => format!("server: {text}"),
        DeltaKind::Chat {
            from: Some(from),
            text,
            channel,
        } => format!("{from} says {text:?} ({channel:?})"),
        DeltaKind::Chat { from: None, text, .. } => format!("announcement {text:?}"),
        DeltaKind::Rejected { error } => format!("rejected: {error}"),
        DeltaKind::Resync { state } => format!(
            "resync {} at revision {} with {} entities",
            state.id,
            state.revision,
            state.entities().len()
        ),
        DeltaKind::Unsubscribed => "unsubscribed".into(),
    }
}
