// SPDX-License-Identifier: GPL-3.0-only

//! The central mutable record for one storage object.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use enumflags2::BitFlags;
use serde_json::Value;

use arbiter_types::{
    ArbiterError, CallbackToken, DiskDescription, DiskId, DiskOption, DiskSnapshot, DiskStage,
    SessionId, UID_UNKNOWN, keys,
};

use crate::personality::Personality;

/// Raw property bag an OS device source reports for one device.
pub type DevicePropertyTable = BTreeMap<String, Value>;

/// The party holding a disk's exclusive claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimHolder {
    pub session: SessionId,
    /// The holder's registered claim-release callback, when it has one.
    pub callback: Option<CallbackToken>,
}

/// Real/effective uid and gid recorded for a disk's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Default for Ownership {
    fn default() -> Self {
        Self {
            uid: UID_UNKNOWN,
            gid: UID_UNKNOWN,
        }
    }
}

/// One tracked storage object: identity, description, pipeline state,
/// ownership, and claim.
///
/// Equality, ordering, and hashing follow the identity string only; the
/// description never participates.
#[derive(Debug, Clone)]
pub struct Disk {
    id: DiskId,
    description: DiskDescription,
    device_properties: DevicePropertyTable,
    pub staged: BitFlags<DiskStage>,
    pub completed: BitFlags<DiskStage>,
    pub options: BitFlags<DiskOption>,
    pub owner: Ownership,
    claim: Option<ClaimHolder>,
    /// Set while a long-running child-device operation runs; defers the
    /// disappearance notification until children quiesce.
    pub busy_since: Option<DateTime<Utc>>,
    pub pending_removal: bool,
    pub personality: Option<Arc<Personality>>,
}

impl Disk {
    /// Build a disk from a device property table.
    ///
    /// Fails when a required property is missing; the partially-built
    /// entity is discarded and the raw device path (if any) is logged.
    pub fn from_device_properties(properties: DevicePropertyTable) -> Result<Self, ArbiterError> {
        let raw_path = properties
            .get(keys::DEVICE_PATH)
            .and_then(Value::as_str)
            .map(str::to_string);

        let missing = |key: &str| {
            tracing::warn!(
                "discarding device {}: missing required property `{key}`",
                raw_path.as_deref().unwrap_or("<unknown>")
            );
            ArbiterError::io_failure(format!("device property `{key}` missing"))
        };

        let device_path = raw_path.clone().ok_or_else(|| missing(keys::DEVICE_PATH))?;
        if properties.get(keys::MEDIA_SIZE).and_then(Value::as_u64).is_none() {
            return Err(missing(keys::MEDIA_SIZE));
        }
        if properties.get(keys::MEDIA_WHOLE).and_then(Value::as_bool).is_none() {
            return Err(missing(keys::MEDIA_WHOLE));
        }

        let mut description: DiskDescription = properties
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        description.set_appearance_time(Utc::now());

        // Device sources report the mounting user for volumes tied to one;
        // everything else keeps the unknown-owner sentinel.
        let owner_field = |key: &str| {
            properties
                .get(key)
                .and_then(Value::as_u64)
                .map(|value| value as u32)
                .unwrap_or(UID_UNKNOWN)
        };
        let owner = Ownership {
            uid: owner_field(keys::OWNER_UID),
            gid: owner_field(keys::OWNER_GID),
        };

        Ok(Self {
            id: DiskId::new(device_path),
            description,
            device_properties: properties,
            staged: BitFlags::empty(),
            completed: BitFlags::empty(),
            options: BitFlags::empty(),
            owner,
            claim: None,
            busy_since: None,
            pending_removal: false,
            personality: None,
        })
    }

    pub fn id(&self) -> &DiskId {
        &self.id
    }

    pub fn description(&self) -> &DiskDescription {
        &self.description
    }

    pub fn description_mut(&mut self) -> &mut DiskDescription {
        &mut self.description
    }

    pub fn device_properties(&self) -> &DevicePropertyTable {
        &self.device_properties
    }

    /// Immutable copy for the client boundary.
    pub fn snapshot(&self) -> DiskSnapshot {
        DiskSnapshot::new(self.id.clone(), self.description.clone())
    }

    pub fn claim_holder(&self) -> Option<&ClaimHolder> {
        self.claim.as_ref()
    }

    /// Install an exclusive claim. Fails with `Busy` while the disk is
    /// claimed; the holder must release first (or lose its release round).
    pub fn claim(&mut self, holder: ClaimHolder) -> Result<(), ArbiterError> {
        if self.claim.is_some() {
            return Err(ArbiterError::busy(format!(
                "disk {} is already claimed",
                self.id
            )));
        }
        self.claim = Some(holder);
        Ok(())
    }

    pub fn release_claim(&mut self) -> Option<ClaimHolder> {
        self.claim.take()
    }

    /// Whether the disk counts as removable/external media for the
    /// unknown-owner access rule.
    pub fn is_removable_media(&self) -> bool {
        self.description.is_removable() || self.description.is_ejectable()
    }

    /// Predicate match: every pair must be present and equal in the
    /// description; the reserved device-properties key is matched against
    /// the raw device table instead. Short-circuits on first mismatch.
    pub fn matches(&self, predicate: &DiskDescription) -> bool {
        for key in predicate.keys() {
            let Some(wanted) = predicate.get(key) else {
                continue;
            };
            if key == keys::DEVICE_PROPERTIES_MATCH {
                let Some(pairs) = wanted.as_object() else {
                    return false;
                };
                for (device_key, device_value) in pairs {
                    if self.device_properties.get(device_key) != Some(device_value) {
                        return false;
                    }
                }
            } else if self.description.get(key) != Some(wanted) {
                return false;
            }
        }
        true
    }

    /// Compare one description value against a candidate.
    pub fn compare_description_value(&self, key: &str, value: &Value) -> bool {
        self.description.get(key) == Some(value)
    }
}

impl PartialEq for Disk {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Disk {}

impl std::hash::Hash for Disk {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
