#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use liveworld_broadcast::{Frame, RecordingTransport, Transport};
use liveworld_common::{MapId, Privilege, SessionId, TileCoord};
use liveworld_kernel::{ApplyError, ChatChannel, Delta, DeltaKind, EditOp, MapSettings, TilePatch};
use liveworld_persist::BlobStore;
use liveworld_script::ScriptHooks;
use liveworld_server::{Engine, EngineConfig, EngineIo, StaticDirectory};

pub const ADA: SessionId = SessionId(1);
pub const BO: SessionId = SessionId(2);
pub const CY: SessionId = SessionId(3);

pub const SETTLE: Duration = Duration::from_secs(5);

/// Two editors and one player.
pub fn directory() -> Arc<StaticDirectory> {
    Arc::new(
        StaticDirectory::new()
            .with(ADA, "ada", Privilege::Editor)
            .with(BO, "bo", Privilege::Editor)
            .with(CY, "cy", Privilege::Player),
    )
}

pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker_threads = 2;
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config.snapshot.interval_secs = 0;
    config.snapshot.every_commands = 0;
    config
}

pub fn start(
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn BlobStore>>,
    hooks: impl ScriptHooks,
) -> Engine {
    let engine = Engine::start(
        config,
        EngineIo {
            transport,
            directory: directory(),
            store,
        },
        hooks,
    )
    .unwrap();
    settle(&engine);
    engine
}

pub fn settle(engine: &Engine) {
    assert!(engine.quiesce(SETTLE), "engine did not settle");
}

pub fn create_map(engine: &Engine, id: u64, width: u32, height: u32, settings: MapSettings) {
    engine
        .submit_system(EditOp::CreateMap {
            map: MapId(id),
            width,
            height,
            settings,
        })
        .unwrap();
    settle(engine);
}

pub fn set_tile(map: u64, x: u32, y: u32, patch: TilePatch) -> liveworld_kernel::CommandKind {
    liveworld_kernel::CommandKind::Edit(EditOp::SetTile {
        map: MapId(map),
        at: TileCoord::new(x, y),
        patch,
    })
}

pub fn decode(frames: &[Frame]) -> Vec<Delta> {
    frames.iter().flat_map(|f| f.decode().unwrap()).collect()
}

pub fn deltas_for(transport: &RecordingTransport, session: SessionId) -> Vec<Delta> {
    decode(&transport.frames_for(session))
}

pub fn rejections(deltas: &[Delta]) -> Vec<ApplyError> {
    deltas
        .iter()
        .filter_map(|d| match &d.kind {
            DeltaKind::Rejected { error } => Some(error.clone()),
            _ => None,
        })
        .collect()
}

/// Chat lines spoken by players or scripts.
pub fn chat(deltas: &[Delta]) -> Vec<String> {
    lines(deltas, |channel| channel != ChatChannel::Server)
}

/// Engine notices, such as players joining.
pub fn notices(deltas: &[Delta]) -> Vec<String> {
    lines(deltas, |channel| channel == ChatChannel::Server)
}

fn lines(deltas: &[Delta], keep: impl Fn(ChatChannel) -> bool) -> Vec<String> {
    deltas
        .iter()
        .filter_map(|d| match &d.kind {
            DeltaKind::Chat { text, channel, .. } if keep(*channel) => Some(text.clone()),
            _ => None,
        })
        .collect()
}
