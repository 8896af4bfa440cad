// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem personalities.
//!
//! A personality describes one pluggable filesystem kind: how to recognize
//! it on a device, how to obtain its volume UUID, and which tools repair,
//! mount, unmount, and rename it. Personalities are loaded once from a
//! directory of TOML descriptors and shared read-only afterwards.
//!
//! Helper invocation convention: the device path is appended after the
//! declared argument list; mount helpers receive `<device> <mountpoint>`
//! and rename helpers `<device> <new-name>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use arbiter_types::{ArbiterError, DiskDescription};

/// Probe tool declaration: one executable with per-stage argument lists.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSpec {
    pub executable: PathBuf,
    #[serde(default)]
    pub recognize_args: Vec<String>,
    #[serde(default)]
    pub uuid_args: Vec<String>,
}

/// Repair tool declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct RepairSpec {
    pub executable: PathBuf,
    /// Arguments for "is-clean, don't fix" mode.
    #[serde(default)]
    pub check_args: Vec<String>,
    /// Arguments for fix mode.
    #[serde(default)]
    pub repair_args: Vec<String>,
    /// Exit status the check mode reports for a dirty volume.
    #[serde(default = "default_dirty_exit_code")]
    pub dirty_exit_code: i32,
}

fn default_dirty_exit_code() -> i32 {
    8
}

/// A single-executable tool declaration (mount, unmount, rename helpers).
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One filesystem personality, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct Personality {
    /// Filesystem kind passed to mount tooling (e.g. "hfs", "msdos").
    pub name: String,
    /// On-disk format name reported to clients after a successful probe.
    pub kind_name: String,
    /// Media kinds this personality probes; empty means any.
    #[serde(default)]
    pub media_kinds: Vec<String>,
    /// FSModule flag: mount through the kernel instead of an external tool.
    #[serde(default)]
    pub in_process: bool,
    #[serde(default)]
    pub probe: Option<ProbeSpec>,
    #[serde(default)]
    pub repair: Option<RepairSpec>,
    #[serde(default)]
    pub mount: Option<ToolSpec>,
    #[serde(default)]
    pub unmount: Option<ToolSpec>,
    #[serde(default)]
    pub rename: Option<ToolSpec>,
    /// Descriptor path; the personality's identity.
    #[serde(skip)]
    pub source: PathBuf,
}

impl Personality {
    pub fn from_toml(source: &Path, text: &str) -> Result<Self, ArbiterError> {
        let mut personality: Personality = toml::from_str(text).map_err(|error| {
            ArbiterError::bad_argument(format!(
                "invalid personality {}: {error}",
                source.display()
            ))
        })?;
        personality.source = source.to_path_buf();
        Ok(personality)
    }

    /// Whether this personality should be probed against the described media.
    pub fn probes_media(&self, description: &DiskDescription) -> bool {
        if self.media_kinds.is_empty() {
            return true;
        }
        match description.media_kind() {
            Some(kind) => self.media_kinds.iter().any(|candidate| candidate == kind),
            None => false,
        }
    }
}

/// All installed personalities, in declaration (filename) order.
#[derive(Debug, Default)]
pub struct PersonalityRegistry {
    personalities: Vec<Arc<Personality>>,
}

impl PersonalityRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Enumerate `*.toml` descriptors under `dir`. Unreadable or invalid
    /// entries are logged and skipped; a missing directory is an error.
    pub fn load(dir: &Path) -> Result<Self, ArbiterError> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|error| {
                ArbiterError::io_failure(format!(
                    "cannot read personality directory {}: {error}",
                    dir.display()
                ))
            })?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        entries.sort();

        let mut registry = Self::empty();
        for path in entries {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(error) => {
                    tracing::warn!("skipping unreadable personality {}: {error}", path.display());
                    continue;
                }
            };
            match Personality::from_toml(&path, &text) {
                Ok(personality) => {
                    tracing::debug!(
                        "loaded personality `{}` from {}",
                        personality.name,
                        path.display()
                    );
                    registry.insert(personality);
                }
                Err(error) => {
                    tracing::warn!("skipping personality {}: {error}", path.display());
                }
            }
        }
        Ok(registry)
    }

    pub fn insert(&mut self, personality: Personality) {
        self.personalities.push(Arc::new(personality));
    }

    /// Probe candidates for the described media, in declaration order.
    pub fn candidates(&self, description: &DiskDescription) -> Vec<Arc<Personality>> {
        self.personalities
            .iter()
            .filter(|personality| personality.probes_media(description))
            .cloned()
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Personality>> {
        self.personalities
            .iter()
            .find(|personality| personality.name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.personalities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personalities.is_empty()
    }
}
