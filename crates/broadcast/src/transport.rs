use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use liveworld_common::SessionId;

use crate::error::TransportError;
use crate::frame::Frame;

/// Network boundary. Implementations hand frames to the session's connection.
pub trait Transport: Send + Sync {
    fn send(&self, frame: &Frame) -> Result<(), TransportError>;
}

/// Keeps every frame it is given. Used by tooling and tests.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<Frame>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Frames delivered to `session`, in send order.
    pub fn frames_for(&self, session: SessionId) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|f| f.session == session)
            .cloned()
            .collect()
    }

    /// Frame count per session.
    pub fn counts(&self) -> BTreeMap<SessionId, usize> {
        let mut counts = BTreeMap::new();
        for frame in self.frames.lock().unwrap_or_else(|p| p.into_inner()).iter() {
            *counts.entry(frame.session).or_insert(0) += 1;
        }
        counts
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.frames
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(frame.clone());
        Ok(())
    }
}

/// Fails sends on request and records the rest. For exercising retry and
/// disconnect paths.
#[derive(Debug, Default)]
pub struct FlakyTransport {
    delivered: RecordingTransport,
    failures: Mutex<BTreeMap<SessionId, u32>>,
    closed: Mutex<BTreeSet<SessionId>>,
    attempts: AtomicU64,
}

impl FlakyTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends to `session` with a transient error.
    pub fn fail_next(&self, session: SessionId, count: u32) {
        *self
            .failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(session)
            .or_insert(0) += count;
    }

    /// Report every further send to `session` as closed.
    pub fn close(&self, session: SessionId) {
        self.closed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session);
    }

    /// Send attempts so far, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Frames that went through.
    pub fn delivered(&self) -> &RecordingTransport {
        &self.delivered
    }
}

impl Transport for FlakyTransport {
    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .closed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&frame.session)
        {
            return Err(TransportError::Closed);
        }
        {
            let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(left) = failures.get_mut(&frame.session)
                && *left > 0
            {
                *left -= 1;
                return Err(TransportError::Transient("injected failure".into()));
            }
        }
        self.delivered.send(frame)
    }
}
