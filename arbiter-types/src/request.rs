// SPDX-License-Identifier: GPL-3.0-only

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

use crate::disk::DiskId;

/// Kinds of arbitration operations a client can queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Claim,
    Release,
    Mount,
    Unmount,
    Eject,
    Rename,
    Probe,
    Refresh,
}

/// Per-request option bits.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationFlags {
    /// Unmount even with open references.
    Force = 1 << 0,
    /// Apply to the whole disk, including child volumes.
    WholeDisk = 1 << 1,
    /// Do not resolve symlinks in caller-supplied paths.
    NoFollow = 1 << 2,
}

/// One in-flight arbitration operation in wire form.
///
/// Carries up to two opaque string arguments; their meaning depends on the
/// kind (mount: target path and filesystem-type list, rename: the new
/// volume name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub kind: RequestKind,
    pub disk: DiskId,
    #[serde(default)]
    pub flags: BitFlags<OperationFlags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg2: Option<String>,
}

impl Request {
    pub fn new(kind: RequestKind, disk: DiskId) -> Self {
        Self {
            kind,
            disk,
            flags: BitFlags::empty(),
            arg1: None,
            arg2: None,
        }
    }

    pub fn with_flags(mut self, flags: BitFlags<OperationFlags>) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_arg1(mut self, arg: impl Into<String>) -> Self {
        self.arg1 = Some(arg.into());
        self
    }

    pub fn with_arg2(mut self, arg: impl Into<String>) -> Self {
        self.arg2 = Some(arg.into());
        self
    }
}
