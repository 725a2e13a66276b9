//! The dispatcher thread: owns interest and the broadcaster, and turns applied
//! batches into frames in the order shards produced them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use liveworld_broadcast::{Broadcaster, TransportError};
use liveworld_common::{EntityId, MapId, Privilege, SessionId};
use liveworld_interest::{InterestChange, InterestError, InterestManager, MapGeometry};
use liveworld_kernel::{ActionOp, Command, Delta, DeltaKind};
use liveworld_pipeline::Pipeline;
use liveworld_script::ScriptBridge;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::session::SessionTable;

/// What an editor asks to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTarget {
    Map(MapId),
    Entity(EntityId),
}

pub(crate) enum Message {
    Batch(Vec<Delta>),
    Connect {
        session: SessionId,
        privilege: Privilege,
    },
    Disconnect {
        session: SessionId,
    },
    Watch {
        session: SessionId,
        target: WatchTarget,
        on: bool,
        reply: Sender<Result<(), InterestError>>,
    },
    Stop,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    pub sent: AtomicU64,
    pub handled: AtomicU64,
    /// Script commands passed on to the pipeline.
    pub forwarded: AtomicU64,
}

#[derive(Clone)]
pub(crate) struct DispatchSender {
    tx: Sender<Message>,
    counters: Arc<DispatchCounters>,
}

impl DispatchSender {
    pub fn channel() -> (Self, Receiver<Message>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sender = Self {
            tx,
            counters: Arc::new(DispatchCounters::default()),
        };
        (sender, rx)
    }

    pub fn counters(&self) -> &Arc<DispatchCounters> {
        &self.counters
    }

    /// False once the dispatcher is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.counters.sent.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(msg).is_err() {
            self.counters.handled.fetch_add(1, Ordering::SeqCst);
            debug!("dispatcher is gone; message dropped");
            return false;
        }
        true
    }
}

/// State owned by the dispatcher thread.
pub(crate) struct DispatchState {
    pub interest: InterestManager,
    pub broadcaster: Broadcaster,
    pub pipeline: Arc<Pipeline>,
    pub bridge: Arc<ScriptBridge>,
    pub sessions: Arc<SessionTable>,
}

pub(crate) struct Dispatcher {
    tx: DispatchSender,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn start(
        tx: DispatchSender,
        rx: Receiver<Message>,
        scripts: Receiver<Command>,
        state: DispatchState,
    ) -> Result<Self, EngineError> {
        let counters = Arc::clone(tx.counters());
        let handle = thread::Builder::new()
            .name("liveworld-dispatch".into())
            .spawn(move || run(state, rx, scripts, counters))
            .map_err(EngineError::Spawn)?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Stop after everything already queued has been delivered.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.tx.send(Message::Stop);
            if handle.join().is_err() {
                warn!("dispatcher panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    mut state: DispatchState,
    rx: Receiver<Message>,
    mut scripts: Receiver<Command>,
    counters: Arc<DispatchCounters>,
) {
    info!("dispatcher started");
    loop {
        crossbeam_channel::select! {
            recv(rx) -> msg => {
                let msg = match msg {
                    Ok(Message::Stop) | Err(_) => break,
                    Ok(msg) => msg,
                };
                state.handle(msg);
                counters.handled.fetch_add(1, Ordering::SeqCst);
            }
            recv(scripts) -> cmd => match cmd {
                Ok(cmd) => {
                    if let Err(err) = state.pipeline.submit(cmd) {
                        warn!(%err, "script command not submitted");
                    }
                    counters.forwarded.fetch_add(1, Ordering::SeqCst);
                }
                Err(_) => scripts = crossbeam_channel::never(),
            },
        }
    }
    counters.handled.fetch_add(1, Ordering::SeqCst);
    info!("dispatcher stopped");
}

impl DispatchState {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Batch(deltas) => self.batch(deltas),
            Message::Connect { session, privilege } => {
                if let Err(err) = self.interest.connect(session, privilege) {
                    warn!(%err, "duplicate connect");
                }
                self.broadcaster.open(session);
            }
            Message::Disconnect { session } => {
                self.interest.disconnect(session);
                self.broadcaster.close(session);
            }
            Message::Watch {
                session,
                target,
                on,
                reply,
            } => {
                let result = self.watch(session, target, on);
                let _ = reply.send(result);
            }
            Message::Stop => {}
        }
    }

    fn watch(&mut self, session: SessionId, target: WatchTarget, on: bool) -> Result<(), InterestError> {
        let pipeline = &self.pipeline;
        let geometry = |map: MapId| pipeline.view(map).map(|view| MapGeometry::from(view.as_ref()));
        let change = match (target, on) {
            (WatchTarget::Map(map), true) => self.interest.watch_map(session, map, &geometry)?,
            (WatchTarget::Map(map), false) => self.interest.unwatch_map(session, map, &geometry)?,
            (WatchTarget::Entity(id), true) => return self.interest.watch_entity(session, id),
            (WatchTarget::Entity(id), false) => return self.interest.unwatch_entity(session, id),
        };
        let outgoing = self.control(&[change]);
        self.deliver(&outgoing);
        Ok(())
    }

    fn batch(&mut self, deltas: Vec<Delta>) {
        let pipeline = &self.pipeline;
        let geometry = |map: MapId| pipeline.view(map).map(|view| MapGeometry::from(view.as_ref()));
        let changes = self.interest.observe(&deltas, &geometry);

        let applied: Vec<Delta> = deltas.iter().filter(|d| !d.is_rejection()).cloned().collect();
        let listings = self.editor_openings(&deltas);
        let mut outgoing = self.control(&changes);
        outgoing.extend(deltas);
        outgoing.extend(listings);
        self.deliver(&outgoing);

        if !applied.is_empty() {
            self.bridge.notify(applied);
        }
    }

    /// Resyncs for entered maps and unsubscribes for left ones.
    fn control(&self, changes: &[InterestChange]) -> Vec<Delta> {
        let mut out = Vec::new();
        for change in changes {
            for map in &change.left {
                out.push(Delta::unsubscribed(change.session, *map));
            }
            for map in &change.entered {
                if let Some(view) = self.pipeline.view(*map) {
                    out.push(Delta::resync(change.session, view));
                }
            }
        }
        out
    }

    /// The map list, for each session whose avatar just opened the editor.
    fn editor_openings(&self, deltas: &[Delta]) -> Vec<Delta> {
        let mut out = Vec::new();
        for delta in deltas {
            if let DeltaKind::FlagsChanged { id, flags, .. } = &delta.kind
                && flags.in_editor
                && let Some(session) = self.interest.session_of(*id)
            {
                debug!(%session, "sending map list to editor");
                out.push(Delta::map_list(session, delta.scope, self.pipeline.map_summaries()));
            }
        }
        out
    }

    fn deliver(&mut self, outgoing: &[Delta]) {
        if outgoing.is_empty() {
            return;
        }
        let interest = &self.interest;
        let report = self.broadcaster.deliver(outgoing, |delta| interest.audience(delta));
        for (session, err) in report.failed {
            self.drop_session(session, &err);
        }
    }

    /// The transport gave up on a session: forget it and remove its avatar.
    fn drop_session(&mut self, session: SessionId, err: &TransportError) {
        warn!(%session, %err, "disconnecting session after transport failure");
        self.interest.disconnect(session);
        let Some(entry) = self.sessions.remove(session) else {
            return;
        };
        if entry.origin.avatar.is_some()
            && let Err(err) = self
                .pipeline
                .submit(Command::action(entry.origin, ActionOp::Leave))
        {
            warn!(%session, %err, "could not remove avatar of failed session");
        }
    }
}
