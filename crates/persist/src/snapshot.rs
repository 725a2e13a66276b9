use liveworld_common::WorldId;
use liveworld_kernel::World;
use serde::{Deserialize, Serialize};

use crate::codec::{cbor_deserialize, cbor_serialize, sha256_hex, zstd_compress, zstd_decompress};
use crate::error::PersistError;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

const MAGIC: &[u8; 4] = b"LWSN";

/// Versioned header stored in front of the compressed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub schema: u32,
    pub world_id: WorldId,
    /// Last commit included in the snapshot.
    pub commit: u64,
    /// Entity id allocator high-water mark.
    pub next_entity: u64,
    pub state_hash: u64,
    pub payload_len: u64,
    pub payload_sha256: String,
}

/// The whole world at a commit boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub world_id: WorldId,
    pub commit: u64,
    pub next_entity: u64,
    pub world: World,
}

pub fn snapshot_key(commit: u64) -> String {
    format!("snapshots/{commit:020}.snap")
}

/// Commit number encoded in a snapshot key.
pub fn snapshot_commit(key: &str) -> Option<u64> {
    key.strip_prefix("snapshots/")?
        .strip_suffix(".snap")?
        .parse()
        .ok()
}

impl Snapshot {
    pub fn new(world_id: WorldId, commit: u64, next_entity: u64, world: World) -> Self {
        Self {
            world_id,
            commit,
            next_entity,
            world,
        }
    }

    pub fn key(&self) -> String {
        snapshot_key(self.commit)
    }

    /// Header + zstd-compressed CBOR of the world.
    pub fn encode(&self) -> Result<Vec<u8>, PersistError> {
        let payload = zstd_compress(&cbor_serialize(&self.world)?)?;
        let header = SnapshotHeader {
            schema: SNAPSHOT_SCHEMA_VERSION,
            world_id: self.world_id,
            commit: self.commit,
            next_entity: self.next_entity,
            state_hash: self.world.state_hash(),
            payload_len: payload.len() as u64,
            payload_sha256: sha256_hex(&payload),
        };
        let header = cbor_serialize(&header)?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| PersistError::Encode("snapshot header too large".into()))?;

        let mut out = Vec::with_capacity(8 + header.len() + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode and verify a snapshot blob. Any damage is reported as
    /// [`PersistError::SnapshotCorrupt`].
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, PersistError> {
        let corrupt = |reason: String| PersistError::SnapshotCorrupt {
            key: key.to_string(),
            reason,
        };
        let (header, payload) = split(key, bytes)?;
        if payload.len() as u64 != header.payload_len {
            return Err(corrupt(format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                header.payload_len
            )));
        }
        let actual = sha256_hex(payload);
        if actual != header.payload_sha256 {
            return Err(corrupt(format!(
                "payload sha256 {actual} does not match {}",
                header.payload_sha256
            )));
        }
        let raw = zstd_decompress(payload).map_err(|e| corrupt(e.to_string()))?;
        let world: World = cbor_deserialize(&raw).map_err(|e| corrupt(e.to_string()))?;
        if world.state_hash() != header.state_hash {
            return Err(corrupt("state hash mismatch".into()));
        }
        world
            .check_consistency(Some(header.next_entity))
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Self {
            world_id: header.world_id,
            commit: header.commit,
            next_entity: header.next_entity,
            world,
        })
    }

    /// Read only the header, without touching the payload.
    pub fn header(key: &str, bytes: &[u8]) -> Result<SnapshotHeader, PersistError> {
        split(key, bytes).map(|(header, _)| header)
    }
}

fn split<'a>(key: &str, bytes: &'a [u8]) -> Result<(SnapshotHeader, &'a [u8]), PersistError> {
    let corrupt = |reason: &str| PersistError::SnapshotCorrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let rest = bytes
        .strip_prefix(MAGIC.as_slice())
        .ok_or_else(|| corrupt("bad magic"))?;
    let (len, rest) = rest
        .split_first_chunk::<4>()
        .ok_or_else(|| corrupt("truncated header length"))?;
    let len = u32::from_le_bytes(*len) as usize;
    if rest.len() < len {
        return Err(corrupt("truncated header"));
    }
    let (header, payload) = rest.split_at(len);
    let header: SnapshotHeader =
        cbor_deserialize(header).map_err(|e| corrupt(&e.to_string()))?;
    if header.schema != SNAPSHOT_SCHEMA_VERSION {
        return Err(PersistError::SchemaMismatch {
            what: "snapshot",
            file_version: header.schema,
            expected_version: SNAPSHOT_SCHEMA_VERSION,
        });
    }
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec2;
    use liveworld_common::{EntityId, MapId, SessionId, TileCoord};
    use liveworld_kernel::{
        ActionOp, Command, EditOp, MapSettings, Origin, Terrain, TilePatch,
    };

    fn sample() -> World {
        let mut world = World::new();
        let editor = Origin::editor(SessionId(1), None);
        world
            .apply(&Command::edit(
                editor,
                EditOp::CreateMap {
                    map: MapId(1),
                    width: 8,
                    height: 8,
                    settings: MapSettings::default(),
                },
            ))
            .unwrap();
        world
            .apply(&Command::edit(
                editor,
                EditOp::SetTile {
                    map: MapId(1),
                    at: TileCoord::new(5, 5),
                    patch: TilePatch::terrain(Terrain::Water),
                },
            ))
            .unwrap();
        world
            .apply(&Command::action(
                Origin::player(SessionId(2), EntityId(3)),
                ActionOp::Enter {
                    name: "pat".into(),
                    map: MapId(1),
                    position: IVec2::new(1, 1),
                },
            ))
            .unwrap();
        world
    }

    #[test]
    fn snapshot_roundtrip_preserves_world() {
        let snap = Snapshot::new(WorldId::new(), 3, 4, sample());
        let bytes = snap.encode().unwrap();
        let loaded = Snapshot::decode(&snap.key(), &bytes).unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(loaded.world.state_hash(), snap.world.state_hash());
        let tile = loaded
            .world
            .map(MapId(1))
            .and_then(|m| m.tile(TileCoord::new(5, 5)))
            .cloned()
            .unwrap();
        assert_eq!(tile.terrain, Terrain::Water);
    }

    #[test]
    fn header_is_cbor_behind_magic_and_length() {
        let snap = Snapshot::new(WorldId::new(), 3, 4, sample());
        let bytes = snap.encode().unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        let len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let header: SnapshotHeader = cbor_deserialize(&bytes[8..8 + len]).unwrap();
        assert_eq!(header.schema, SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(header.commit, 3);
        assert_eq!(header.state_hash, snap.world.state_hash());
        assert_eq!(header.payload_len as usize, bytes.len() - 8 - len);
    }

    #[test]
    fn flipped_payload_byte_is_corruption() {
        let snap = Snapshot::new(WorldId::new(), 3, 4, sample());
        let mut bytes = snap.encode().unwrap();
        if let Some(byte) = bytes.last_mut() {
            *byte ^= 0xff;
        }
        assert!(matches!(
            Snapshot::decode("snapshots/x.snap", &bytes),
            Err(PersistError::SnapshotCorrupt { .. })
        ));
    }

    #[test]
    fn truncated_blob_is_corruption() {
        let snap = Snapshot::new(WorldId::new(), 3, 4, sample());
        let bytes = snap.encode().unwrap();
        for cut in [0, 3, 7, bytes.len() / 2] {
            assert!(matches!(
                Snapshot::decode("snapshots/x.snap", &bytes[..cut]),
                Err(PersistError::SnapshotCorrupt { .. })
            ));
        }
    }

    #[test]
    fn ids_above_the_recorded_high_water_are_rejected() {
        // Entity 3 exists, so a high-water mark of 2 is inconsistent.
        let snap = Snapshot::new(WorldId::new(), 3, 2, sample());
        let bytes = snap.encode().unwrap();
        assert!(matches!(
            Snapshot::decode("snapshots/x.snap", &bytes),
            Err(PersistError::SnapshotCorrupt { .. })
        ));
    }

    #[test]
    fn keys_encode_the_commit() {
        assert_eq!(snapshot_commit(&snapshot_key(42)), Some(42));
        assert_eq!(snapshot_commit("log/1.log"), None);
    }
}
