// SPDX-License-Identifier: GPL-3.0-only

//! Events delivered to client sessions and the callback kinds that
//! subscribe to them.

use serde::{Deserialize, Serialize};

use crate::disk::{DiskDescription, DiskId};
use crate::id::{CallbackToken, RoundId};

/// Classes of callbacks a session may register.
///
/// Notify kinds deliver an event and expect no response. Decision kinds
/// deliver an approval round and expect at most one vote back. Peek is
/// dispatched in explicit order but can never veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    DiskAppeared,
    DiskDisappeared,
    DiskDescriptionChanged,
    DiskClassic,
    Idle,
    Peek,
    Claim,
    ClaimRelease,
    EjectApproval,
    MountApproval,
    UnmountApproval,
}

impl CallbackKind {
    /// Kinds whose invocation produces a vote routed back to the engine.
    pub fn is_decision(self) -> bool {
        matches!(
            self,
            Self::ClaimRelease | Self::EjectApproval | Self::MountApproval | Self::UnmountApproval
        )
    }

    /// Kinds dispatched in explicit (order, registration) order.
    pub fn is_ordered(self) -> bool {
        self == Self::Peek || self.is_decision()
    }
}

/// Immutable copy of a disk handed across the client boundary.
///
/// The description travels with the snapshot exactly once per dispatch and
/// is dropped with it; clients never hold references into live engine
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub id: DiskId,
    pub description: DiskDescription,
}

impl DiskSnapshot {
    pub fn new(id: DiskId, description: DiskDescription) -> Self {
        Self { id, description }
    }
}

/// Events a session receives on its event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum DiskEvent {
    Appeared(DiskSnapshot),
    Disappeared(DiskSnapshot),
    DescriptionChanged {
        disk: DiskSnapshot,
        changed_keys: Vec<String>,
    },
    Peek(DiskSnapshot),
    /// A claim was installed on the disk.
    Claimed(DiskSnapshot),
    /// One decision callback's turn in an approval round. `token` names
    /// the registered callback being consulted; the session must answer
    /// with at most one vote for (`round`, `token`).
    ApprovalRequested {
        round: RoundId,
        token: CallbackToken,
        kind: CallbackKind,
        disk: DiskSnapshot,
    },
    /// The current claim holder is asked to give up its claim.
    ClaimReleaseRequested {
        round: RoundId,
        token: CallbackToken,
        disk: DiskSnapshot,
    },
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::keys;

    #[test]
    fn decision_kinds_are_ordered() {
        for kind in [
            CallbackKind::ClaimRelease,
            CallbackKind::EjectApproval,
            CallbackKind::MountApproval,
            CallbackKind::UnmountApproval,
        ] {
            assert!(kind.is_decision());
            assert!(kind.is_ordered());
        }
        assert!(CallbackKind::Peek.is_ordered());
        assert!(!CallbackKind::Peek.is_decision());
        assert!(!CallbackKind::DiskAppeared.is_ordered());
    }

    #[test]
    fn description_changed_event_roundtrips() {
        let mut description = DiskDescription::new();
        description.set(keys::VOLUME_NAME, "Untitled");
        let event = DiskEvent::DescriptionChanged {
            disk: DiskSnapshot::new(DiskId::from("disk/sdc2"), description),
            changed_keys: vec![keys::VOLUME_NAME.to_string()],
        };

        let json = serde_json::to_string(&event).expect("serialize event");
        let parsed: DiskEvent = serde_json::from_str(&json).expect("deserialize event");
        assert_eq!(parsed, event);
    }
}
