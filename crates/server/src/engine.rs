use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use liveworld_broadcast::{Broadcaster, Transport};
use liveworld_common::{EntityId, MapId, Privilege, SessionId, Version};
use liveworld_interest::InterestManager;
use liveworld_kernel::{ActionOp, Command, CommandKind, Counters, EditOp, MapState, Origin, Stamp};
use liveworld_persist::{
    BlobStore, Captured, RecoveryReport, SnapshotManager, SnapshotSource, SnapshotWriter,
};
use liveworld_pipeline::{Capture, Pipeline};
use liveworld_script::{ScriptBridge, ScriptHooks};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::directory::SessionDirectory;
use crate::dispatch::{DispatchSender, DispatchState, Dispatcher, Message, WatchTarget};
use crate::error::EngineError;
use crate::hooks::EngineHooks;
use crate::session::{SessionEntry, SessionTable};

/// The engine's collaborators on the outside.
pub struct EngineIo {
    pub transport: Arc<dyn Transport>,
    pub directory: Arc<dyn SessionDirectory>,
    /// Without a store nothing is persisted.
    pub store: Option<Arc<dyn BlobStore>>,
}

struct PipelineSource(Arc<Pipeline>);

impl SnapshotSource for PipelineSource {
    fn last_commit(&self) -> u64 {
        self.0.counters().last_commit()
    }

    fn capture(&self) -> Captured {
        let Capture {
            commit,
            next_entity,
            world,
        } = self.0.capture();
        Captured {
            commit,
            next_entity,
            world,
        }
    }
}

/// Counters sampled by [`Engine::quiesce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    pending: usize,
    sent: u64,
    handled: u64,
    forwarded: u64,
    queued: usize,
    emitted: u64,
    commit: u64,
}

impl Progress {
    fn idle(&self) -> bool {
        self.pending == 0
            && self.sent == self.handled
            && self.queued == 0
            && self.forwarded == self.emitted
    }
}

/// A running world: pipeline, dispatcher, script bridge and snapshot writer.
///
/// Fields drop in declaration order: the writer takes its final snapshot
/// while the pipeline is still alive.
pub struct Engine {
    writer: Option<SnapshotWriter>,
    dispatcher: Dispatcher,
    bridge: Arc<ScriptBridge>,
    pipeline: Arc<Pipeline>,
    persistence: Option<Arc<SnapshotManager>>,
    dispatch: DispatchSender,
    sessions: Arc<SessionTable>,
    directory: Arc<dyn SessionDirectory>,
    recovery: Option<RecoveryReport>,
    config: EngineConfig,
}

impl Engine {
    /// Recover the world from the store, if any, and start every thread.
    pub fn start(
        config: EngineConfig,
        io: EngineIo,
        hooks: impl ScriptHooks,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let persistence = io
            .store
            .map(SnapshotManager::open)
            .transpose()?
            .map(Arc::new);

        let (script_tx, script_rx) = crossbeam_channel::unbounded();
        let bridge = Arc::new(ScriptBridge::start(hooks, config.bridge(), script_tx)?);
        let (dispatch, dispatch_rx) = DispatchSender::channel();

        let counters = Arc::new(Counters::default());
        let pipeline = Arc::new(Pipeline::start(
            config.pipeline(),
            Arc::clone(&counters),
            Arc::new(EngineHooks {
                bridge: Arc::clone(&bridge),
                log: persistence.clone(),
                dispatch: dispatch.clone(),
            }),
        )?);

        let recovery = match &persistence {
            Some(store) => Some(recover(store, &pipeline, &counters)?),
            None => None,
        };

        let sessions = Arc::new(SessionTable::default());
        let dispatcher = Dispatcher::start(
            dispatch.clone(),
            dispatch_rx,
            script_rx,
            DispatchState {
                interest: InterestManager::new(config.interest()),
                broadcaster: Broadcaster::new(io.transport, config.retry()),
                pipeline: Arc::clone(&pipeline),
                bridge: Arc::clone(&bridge),
                sessions: Arc::clone(&sessions),
            },
        )?;

        let writer = persistence
            .as_ref()
            .map(|store| {
                SnapshotWriter::start(
                    Arc::clone(store),
                    Arc::new(PipelineSource(Arc::clone(&pipeline))),
                    config.snapshot(),
                )
            })
            .transpose()?;

        let engine = Self {
            writer,
            dispatcher,
            bridge,
            pipeline,
            persistence,
            dispatch,
            sessions,
            directory: io.directory,
            recovery,
            config,
        };
        engine.evict_stale_avatars()?;
        info!(
            workers = engine.config.worker_threads,
            persistent = engine.persistence.is_some(),
            last_commit = engine.pipeline.counters().last_commit(),
            "engine started"
        );
        Ok(engine)
    }

    /// Sessions do not survive a restart; avatars left in a recovered world leave now.
    fn evict_stale_avatars(&self) -> Result<(), EngineError> {
        if self.recovery.is_none() {
            return Ok(());
        }
        let world = self.pipeline.capture().world;
        for entity in world.entities() {
            if let Some(session) = entity.session() {
                info!(%session, avatar = %entity.id, "removing avatar of a session lost in restart");
                self.pipeline.submit(Command::action(
                    Origin {
                        session,
                        privilege: Privilege::Player,
                        avatar: Some(entity.id),
                    },
                    ActionOp::Leave,
                ))?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What recovery did at startup. `None` without a store.
    pub fn recovery(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn persistence(&self) -> Option<&Arc<SnapshotManager>> {
        self.persistence.as_ref()
    }

    /// Admit a session and create its avatar at the configured start point.
    pub fn connect(&self, session: SessionId) -> Result<EntityId, EngineError> {
        if session.is_system() {
            return Err(EngineError::UnknownSession(session));
        }
        let profile = self
            .directory
            .lookup(session)
            .ok_or(EngineError::UnknownSession(session))?;
        let avatar = self.pipeline.counters().allocate_entity();
        let origin = Origin {
            session,
            privilege: profile.privilege,
            avatar: Some(avatar),
        };
        let entry = SessionEntry {
            name: profile.name.clone(),
            origin,
        };
        if !self.sessions.insert(session, entry) {
            return Err(EngineError::AlreadyConnected(session));
        }
        self.dispatch.send(Message::Connect {
            session,
            privilege: profile.privilege,
        });
        self.pipeline.submit(Command::action(
            origin,
            ActionOp::Enter {
                name: profile.name,
                map: self.config.start_map(),
                position: self.config.start_position(),
            },
        ))?;
        info!(%session, %avatar, privilege = ?profile.privilege, "session connected");
        Ok(avatar)
    }

    /// Remove a session. Commands it already submitted still apply; its avatar leaves after them.
    pub fn disconnect(&self, session: SessionId) -> Result<(), EngineError> {
        let entry = self
            .sessions
            .remove(session)
            .ok_or(EngineError::NotConnected(session))?;
        self.pipeline
            .submit(Command::action(entry.origin, ActionOp::Leave))?;
        self.dispatch.send(Message::Disconnect { session });
        info!(%session, "session disconnected");
        Ok(())
    }

    pub fn is_connected(&self, session: SessionId) -> bool {
        self.sessions.get(session).is_some()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.ids()
    }

    /// The avatar the session controls.
    pub fn avatar(&self, session: SessionId) -> Option<EntityId> {
        self.sessions.get(session).and_then(|e| e.origin.avatar)
    }

    /// Submit a command on behalf of a connected session.
    pub fn submit(&self, session: SessionId, kind: CommandKind) -> Result<Stamp, EngineError> {
        self.submit_command(session, kind, None)
    }

    /// Like [`submit`](Self::submit), rejected with `ConflictStale` unless the
    /// target is still at `version`.
    pub fn submit_expecting(
        &self,
        session: SessionId,
        kind: CommandKind,
        version: Version,
    ) -> Result<Stamp, EngineError> {
        self.submit_command(session, kind, Some(version))
    }

    fn submit_command(
        &self,
        session: SessionId,
        kind: CommandKind,
        expect: Option<Version>,
    ) -> Result<Stamp, EngineError> {
        let entry = self
            .sessions
            .get(session)
            .ok_or(EngineError::NotConnected(session))?;
        let mut cmd = Command::new(entry.origin, kind);
        cmd.expect = expect;
        Ok(self.pipeline.submit(cmd)?)
    }

    /// Apply an edit with engine authority, e.g. from an operator console.
    pub fn submit_system(&self, op: EditOp) -> Result<Stamp, EngineError> {
        Ok(self.pipeline.submit(Command::edit(Origin::system(), op))?)
    }

    /// Editor-only: observe a map or entity regardless of avatar position.
    pub fn watch(&self, session: SessionId, target: WatchTarget) -> Result<(), EngineError> {
        self.set_watch(session, target, true)
    }

    pub fn unwatch(&self, session: SessionId, target: WatchTarget) -> Result<(), EngineError> {
        self.set_watch(session, target, false)
    }

    fn set_watch(&self, session: SessionId, target: WatchTarget, on: bool) -> Result<(), EngineError> {
        let (reply, result) = crossbeam_channel::bounded(1);
        if !self.dispatch.send(Message::Watch {
            session,
            target,
            on,
            reply,
        }) {
            return Err(EngineError::Stopped);
        }
        Ok(result.recv().map_err(|_| EngineError::Stopped)??)
    }

    /// Frozen view of a map.
    pub fn view(&self, map: MapId) -> Option<Arc<MapState>> {
        self.pipeline.view(map)
    }

    /// The whole world at a commit boundary.
    pub fn capture(&self) -> Capture {
        self.pipeline.capture()
    }

    pub fn last_commit(&self) -> u64 {
        self.pipeline.counters().last_commit()
    }

    /// Take a snapshot now. `Ok(None)` without a store or when nothing changed.
    pub fn snapshot_now(&self) -> Result<Option<String>, EngineError> {
        match &self.writer {
            Some(writer) => Ok(writer.snapshot_now()?),
            None => Ok(None),
        }
    }

    fn progress(&self) -> Progress {
        let dispatch = self.dispatch.counters();
        let activity = self.bridge.activity();
        Progress {
            pending: self.pipeline.pending(),
            sent: dispatch.sent.load(Ordering::SeqCst),
            handled: dispatch.handled.load(Ordering::SeqCst),
            forwarded: dispatch.forwarded.load(Ordering::SeqCst),
            queued: activity.queued,
            emitted: activity.emitted,
            commit: self.pipeline.counters().last_commit(),
        }
    }

    /// Wait until every submitted command has been applied and delivered and
    /// the script thread has nothing left to issue. False on timeout.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let first = self.progress();
            if first.idle() && self.progress() == first {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(?first, "engine did not quiesce in time");
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Drain, write a final snapshot and stop every thread.
    pub fn shutdown(mut self) -> Result<(), EngineError> {
        self.quiesce(Duration::from_secs(5));
        if let Some(writer) = self.writer.take() {
            writer.shutdown();
        }
        self.dispatcher.stop();
        self.bridge.shutdown();
        let last_commit = self.last_commit();
        let Self { pipeline, .. } = self;
        match Arc::try_unwrap(pipeline) {
            Ok(pipeline) => pipeline.shutdown()?,
            Err(_) => warn!("pipeline still shared at shutdown; workers stop when it drops"),
        }
        info!(last_commit, "engine stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sessions", &self.sessions.ids().len())
            .field("last_commit", &self.last_commit())
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

fn recover(
    store: &SnapshotManager,
    pipeline: &Pipeline,
    counters: &Counters,
) -> Result<RecoveryReport, EngineError> {
    let report = store.recover(
        |snapshot| {
            counters.reserve(EntityId(snapshot.next_entity.saturating_sub(1)));
            counters.observe_commit(snapshot.commit);
            pipeline.install(snapshot.world);
        },
        |record| pipeline.replay(record.commit, &record.command).map(drop),
    )?;
    counters.observe_commit(report.last_commit);
    Ok(report)
}
