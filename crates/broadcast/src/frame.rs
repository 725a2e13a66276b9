use liveworld_common::{MapId, SessionId};
use liveworld_kernel::{Delivery, Delta, Stamp};
use serde::{Deserialize, Serialize};

use crate::error::BroadcastError;

/// One outbound message: a run of deltas for one scope, addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub session: SessionId,
    pub scope: MapId,
    /// Highest scope revision carried.
    pub revision: u64,
    /// Highest commit sequence carried.
    pub commit: u64,
    /// Stamp of the last command in the frame.
    pub stamp: Stamp,
    pub class: Delivery,
    /// CBOR-encoded `Vec<Delta>`.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode `deltas`, which must all belong to `scope`.
    pub fn encode(session: SessionId, scope: MapId, deltas: &[&Delta]) -> Result<Self, BroadcastError> {
        let mut payload = Vec::new();
        ciborium::into_writer(&deltas, &mut payload)
            .map_err(|err| BroadcastError::Encode(err.to_string()))?;
        let class = if deltas.iter().all(|d| d.delivery() == Delivery::Cosmetic) {
            Delivery::Cosmetic
        } else {
            Delivery::State
        };
        Ok(Self {
            session,
            scope,
            revision: deltas.iter().map(|d| d.revision).max().unwrap_or(0),
            commit: deltas.iter().map(|d| d.commit).max().unwrap_or(0),
            stamp: deltas.last().map(|d| d.cause).unwrap_or_default(),
            class,
            payload,
        })
    }

    pub fn decode(&self) -> Result<Vec<Delta>, BroadcastError> {
        ciborium::from_reader(self.payload.as_slice())
            .map_err(|err| BroadcastError::Decode(err.to_string()))
    }

    pub fn is_cosmetic(&self) -> bool {
        self.class == Delivery::Cosmetic
    }
}
