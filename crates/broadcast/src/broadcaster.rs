use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

use liveworld_common::{MapId, SessionId};
use liveworld_kernel::{Audience, Delta, DeltaKind};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::frame::Frame;
use crate::retry::RetryPolicy;
use crate::transport::Transport;

/// Per-session outbound stream state.
#[derive(Debug, Default)]
struct Stream {
    /// Revision of the last resync per map; scope deltas at or below it are stale.
    resynced: BTreeMap<MapId, u64>,
    sent: u64,
    dropped: u64,
}

/// Counters for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub sent: u64,
    pub dropped: u64,
}

/// Outcome of one [`Broadcaster::deliver`] call.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub frames: usize,
    /// Cosmetic frames dropped after a failed send.
    pub dropped: usize,
    /// Scope deltas skipped because a later resync already covered them.
    pub suppressed: usize,
    /// Sessions whose stream failed for good. They have been closed here and
    /// must be disconnected by the caller.
    pub failed: Vec<(SessionId, TransportError)>,
}

/// Turns applied delta batches into ordered per-session frames.
///
/// Frames are sent synchronously in batch order, so a session sees the
/// deltas of one scope in the order they were applied.
pub struct Broadcaster {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    streams: BTreeMap<SessionId, Stream>,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            streams: BTreeMap::new(),
        }
    }

    pub fn open(&mut self, session: SessionId) {
        self.streams.entry(session).or_default();
    }

    pub fn close(&mut self, session: SessionId) -> bool {
        self.streams.remove(&session).is_some()
    }

    pub fn is_open(&self, session: SessionId) -> bool {
        self.streams.contains_key(&session)
    }

    pub fn stats(&self, session: SessionId) -> Option<StreamStats> {
        self.streams.get(&session).map(|s| StreamStats {
            sent: s.sent,
            dropped: s.dropped,
        })
    }

    /// Deliver `batch` to the sessions `audience` names for each delta.
    pub fn deliver<F>(&mut self, batch: &[Delta], audience: F) -> DeliveryReport
    where
        F: Fn(&Delta) -> BTreeSet<SessionId>,
    {
        let _span = tracing::debug_span!("dispatch", deltas = batch.len()).entered();
        let mut report = DeliveryReport::default();

        // Per session, runs of consecutive deltas sharing a scope.
        let mut outgoing: BTreeMap<SessionId, Vec<(MapId, Vec<&Delta>)>> = BTreeMap::new();
        for delta in batch {
            for session in audience(delta) {
                let Some(stream) = self.streams.get_mut(&session) else {
                    continue;
                };
                match &delta.kind {
                    DeltaKind::Resync { state } => {
                        stream.resynced.insert(delta.scope, state.revision);
                    }
                    DeltaKind::Unsubscribed => {
                        stream.resynced.remove(&delta.scope);
                    }
                    _ => {
                        if delta.audience == Audience::Scope
                            && stream
                                .resynced
                                .get(&delta.scope)
                                .is_some_and(|&mark| delta.revision <= mark)
                        {
                            report.suppressed += 1;
                            continue;
                        }
                    }
                }
                let runs = outgoing.entry(session).or_default();
                match runs.last_mut() {
                    Some((scope, deltas)) if *scope == delta.scope => deltas.push(delta),
                    _ => runs.push((delta.scope, vec![delta])),
                }
            }
        }

        for (session, runs) in outgoing {
            for (scope, deltas) in runs {
                let frame = match Frame::encode(session, scope, &deltas) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%session, %scope, %err, "dropping unencodable frame");
                        continue;
                    }
                };
                match self.send(&frame) {
                    Ok(()) => {
                        report.frames += 1;
                        if let Some(stream) = self.streams.get_mut(&session) {
                            stream.sent += 1;
                        }
                    }
                    Err(TransportError::Transient(reason)) if frame.is_cosmetic() => {
                        warn!(%session, %scope, %reason, "dropped cosmetic frame");
                        report.dropped += 1;
                        if let Some(stream) = self.streams.get_mut(&session) {
                            stream.dropped += 1;
                        }
                    }
                    Err(err) => {
                        warn!(%session, %scope, %err, "session stream failed");
                        self.streams.remove(&session);
                        report.failed.push((session, err));
                        break;
                    }
                }
            }
        }

        if report.frames > 0 || !report.failed.is_empty() {
            debug!(
                frames = report.frames,
                dropped = report.dropped,
                suppressed = report.suppressed,
                failed = report.failed.len(),
                "batch delivered"
            );
        }
        report
    }

    /// Send one frame, retrying transient failures of state frames.
    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let mut attempt = 1;
        loop {
            match self.transport.send(frame) {
                Ok(()) => return Ok(()),
                Err(TransportError::Closed) => return Err(TransportError::Closed),
                Err(err) if frame.is_cosmetic() || attempt >= self.retry.max_attempts => {
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.retry.backoff(attempt);
                    debug!(session = %frame.session, attempt, ?delay, %err, "retrying frame");
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("retry", &self.retry)
            .field("sessions", &self.streams.len())
            .finish()
    }
}
