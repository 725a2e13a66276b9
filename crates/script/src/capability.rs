use liveworld_kernel::{EditOp, ScriptOp};
use serde::{Deserialize, Serialize};

use crate::error::ScriptError;

/// What commands a script may issue on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptCapabilities {
    pub announce: bool,
    /// Attribute edits, NPC spawns and despawns.
    pub world_edits: bool,
    pub teleport: bool,
}

impl Default for ScriptCapabilities {
    fn default() -> Self {
        Self {
            announce: true,
            world_edits: true,
            teleport: true,
        }
    }
}

impl ScriptCapabilities {
    pub fn none() -> Self {
        Self {
            announce: false,
            world_edits: false,
            teleport: false,
        }
    }

    pub fn check(&self, op: &ScriptOp) -> Result<(), ScriptError> {
        let (granted, name) = match op {
            ScriptOp::Announce { .. } => (self.announce, "announce"),
            ScriptOp::Edit(EditOp::Teleport { .. }) => (self.teleport, "teleport"),
            ScriptOp::Edit(
                EditOp::SetAttribute { .. } | EditOp::SpawnNpc { .. } | EditOp::Despawn { .. },
            ) => (self.world_edits, "world_edits"),
            // Map and tile edits stay with editors.
            ScriptOp::Edit(_) => (false, "map_edits"),
        };
        if granted {
            Ok(())
        } else {
            Err(ScriptError::CapabilityDenied(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveworld_common::{EntityId, MapId};

    #[test]
    fn map_edits_are_never_granted() {
        let op = ScriptOp::Edit(EditOp::RemoveMap { map: MapId(1) });
        assert_eq!(
            ScriptCapabilities::default().check(&op),
            Err(ScriptError::CapabilityDenied("map_edits"))
        );
    }

    #[test]
    fn capabilities_gate_their_ops() {
        let caps = ScriptCapabilities {
            teleport: false,
            ..ScriptCapabilities::default()
        };
        let despawn = ScriptOp::Edit(EditOp::Despawn {
            entity: EntityId(3),
        });
        assert!(caps.check(&despawn).is_ok());
        assert!(ScriptCapabilities::none().check(&despawn).is_err());
        let announce = ScriptOp::Announce {
            map: MapId(1),
            text: "hello".into(),
        };
        assert!(caps.check(&announce).is_ok());
    }
}
