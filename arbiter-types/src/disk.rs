// SPDX-License-Identifier: GPL-3.0-only

//! Disk identity, description dictionaries, and per-disk flag sets.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use enumflags2::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Owner uid recorded when no owning user is known for a disk.
///
/// Grants owner-equivalent access only for removable/external media; see
/// the authorization policy in arbiter-core.
pub const UID_UNKNOWN: u32 = u32::MAX;

/// Stable opaque identity of one tracked storage object.
///
/// Derived from the device path (whole media) or a volume-derived id;
/// immutable for the disk's lifetime. Disks compare equal iff their ids
/// compare equal, independent of description contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiskId(String);

impl DiskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DiskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DiskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Well-known description keys.
///
/// The description is an open dictionary; these constants cover the keys
/// the daemon itself reads and writes.
pub mod keys {
    pub const APPEARANCE_TIME: &str = "appearance-time";
    pub const BUS_NAME: &str = "bus-name";
    pub const BUS_PATH: &str = "bus-path";
    pub const DEVICE_MAJOR: &str = "device-major";
    pub const DEVICE_MINOR: &str = "device-minor";
    pub const DEVICE_MODEL: &str = "device-model";
    pub const DEVICE_PATH: &str = "device-path";
    pub const DEVICE_PROTOCOL: &str = "device-protocol";
    pub const DEVICE_UNIT: &str = "device-unit";
    pub const DEVICE_VENDOR: &str = "device-vendor";
    pub const MEDIA_EJECTABLE: &str = "media-ejectable";
    pub const MEDIA_KIND: &str = "media-kind";
    pub const MEDIA_NAME: &str = "media-name";
    pub const MEDIA_REMOVABLE: &str = "media-removable";
    pub const MEDIA_SIZE: &str = "media-size";
    pub const MEDIA_WHOLE: &str = "media-whole";
    pub const MEDIA_WRITABLE: &str = "media-writable";
    pub const OWNER_GID: &str = "owner-gid";
    pub const OWNER_UID: &str = "owner-uid";
    pub const VOLUME_KIND: &str = "volume-kind";
    pub const VOLUME_NAME: &str = "volume-name";
    pub const VOLUME_NETWORK: &str = "volume-network";
    pub const VOLUME_PATH: &str = "volume-path";
    pub const VOLUME_UUID: &str = "volume-uuid";

    /// Reserved predicate key: its value is matched against the disk's raw
    /// device property table instead of the description dictionary.
    pub const DEVICE_PROPERTIES_MATCH: &str = "device-properties-match";
}

/// Description dictionary for one disk.
///
/// Mutated by the engine and the filesystem driver as information becomes
/// available; everything that leaves the engine is a snapshot copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiskDescription {
    entries: BTreeMap<String, Value>,
}

impl DiskDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Insert or replace a value. Returns true when the stored value
    /// actually changed.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        match self.entries.get(key) {
            Some(existing) if *existing == value => false,
            _ => {
                self.entries.insert(key.to_string(), value);
                true
            }
        }
    }

    /// Remove a key. Returns true when the key was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn device_path(&self) -> Option<&str> {
        self.get_str(keys::DEVICE_PATH)
    }

    pub fn media_size(&self) -> Option<u64> {
        self.get_u64(keys::MEDIA_SIZE)
    }

    pub fn media_kind(&self) -> Option<&str> {
        self.get_str(keys::MEDIA_KIND)
    }

    pub fn is_whole(&self) -> bool {
        self.get_bool(keys::MEDIA_WHOLE).unwrap_or(false)
    }

    pub fn is_removable(&self) -> bool {
        self.get_bool(keys::MEDIA_REMOVABLE).unwrap_or(false)
    }

    pub fn is_ejectable(&self) -> bool {
        self.get_bool(keys::MEDIA_EJECTABLE).unwrap_or(false)
    }

    pub fn volume_name(&self) -> Option<&str> {
        self.get_str(keys::VOLUME_NAME)
    }

    pub fn volume_path(&self) -> Option<&str> {
        self.get_str(keys::VOLUME_PATH)
    }

    pub fn volume_uuid(&self) -> Option<Uuid> {
        self.get_str(keys::VOLUME_UUID)
            .and_then(|raw| raw.parse().ok())
    }

    pub fn set_appearance_time(&mut self, at: DateTime<Utc>) {
        self.set(keys::APPEARANCE_TIME, at.to_rfc3339());
    }

    pub fn appearance_time(&self) -> Option<DateTime<Utc>> {
        self.get_str(keys::APPEARANCE_TIME)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
    }

    /// True iff every key/value pair of `predicate` is present here with an
    /// equal value. Short-circuits on the first mismatch. The reserved
    /// device-properties key is not interpreted at this level.
    pub fn satisfies(&self, predicate: &DiskDescription) -> bool {
        predicate
            .entries
            .iter()
            .all(|(key, value)| self.entries.get(key) == Some(value))
    }
}

impl FromIterator<(String, Value)> for DiskDescription {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Pipeline stages a disk has staged or completed.
///
/// Used to avoid re-running stages and to gate state transitions; distinct
/// from [`DiskOption`] policy bits.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskStage {
    Probe = 1 << 0,
    Peek = 1 << 1,
    Repair = 1 << 2,
    Approve = 1 << 3,
    Authorize = 1 << 4,
    Mount = 1 << 5,
}

/// Persistent per-disk policy bits, settable by privileged callers.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskOption {
    AutoMount = 1 << 0,
    AutoMountNoDefer = 1 << 1,
    EjectOnLogout = 1 << 2,
    Private = 1 << 3,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_description() -> DiskDescription {
        let mut description = DiskDescription::new();
        description.set(keys::DEVICE_PATH, "/dev/sdb");
        description.set(keys::MEDIA_SIZE, 16_000_000_000u64);
        description.set(keys::MEDIA_WHOLE, true);
        description.set(keys::MEDIA_REMOVABLE, true);
        description.set(keys::VOLUME_NAME, "BACKUP");
        description
    }

    #[test]
    fn set_reports_whether_value_changed() {
        let mut description = sample_description();
        assert!(!description.set(keys::VOLUME_NAME, "BACKUP"));
        assert!(description.set(keys::VOLUME_NAME, "ARCHIVE"));
        assert_eq!(description.volume_name(), Some("ARCHIVE"));
    }

    #[test]
    fn satisfies_requires_every_pair() {
        let description = sample_description();

        let mut predicate = DiskDescription::new();
        predicate.set(keys::MEDIA_REMOVABLE, true);
        predicate.set(keys::VOLUME_NAME, "BACKUP");
        assert!(description.satisfies(&predicate));

        predicate.set(keys::MEDIA_SIZE, 1u64);
        assert!(!description.satisfies(&predicate));

        let mut absent = DiskDescription::new();
        absent.set("no-such-key", json!("x"));
        assert!(!description.satisfies(&absent));
    }

    #[test]
    fn description_roundtrips_as_flat_map() {
        let description = sample_description();
        let json = serde_json::to_string(&description).expect("serialize description");
        let parsed: DiskDescription = serde_json::from_str(&json).expect("deserialize description");
        assert_eq!(parsed, description);
        // transparent map form, no wrapper object
        assert!(json.contains("\"device-path\":\"/dev/sdb\""));
    }

    #[test]
    fn appearance_time_roundtrips() {
        let mut description = DiskDescription::new();
        let at = Utc::now();
        description.set_appearance_time(at);
        let read = description.appearance_time().expect("appearance time");
        assert_eq!(read.timestamp(), at.timestamp());
    }
}
