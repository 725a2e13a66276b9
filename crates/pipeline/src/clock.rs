use std::sync::atomic::{AtomicU64, Ordering};

use liveworld_common::{LogicalTime, SessionId};
use liveworld_kernel::Stamp;

/// Logical clock plus arrival counter. Assigns the ordering key of every command.
#[derive(Debug, Default)]
pub struct Stamper {
    time: AtomicU64,
    arrival: AtomicU64,
}

impl Stamper {
    pub fn new(start: LogicalTime) -> Self {
        Self {
            time: AtomicU64::new(start.0),
            arrival: AtomicU64::new(0),
        }
    }

    pub fn stamp(&self, session: SessionId) -> Stamp {
        let time = self.time.fetch_add(1, Ordering::SeqCst) + 1;
        let arrival = self.arrival.fetch_add(1, Ordering::SeqCst) + 1;
        Stamp {
            time: LogicalTime(time),
            session,
            arrival,
        }
    }

    /// Move the clock past a time seen elsewhere, e.g. in a replayed log.
    pub fn observe(&self, time: LogicalTime) {
        self.time.fetch_max(time.0, Ordering::SeqCst);
    }

    pub fn now(&self) -> LogicalTime {
        LogicalTime(self.time.load(Ordering::SeqCst))
    }
}
