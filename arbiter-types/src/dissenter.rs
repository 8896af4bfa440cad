// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::error::{ArbiterError, ArbiterErrorKind};

/// An immutable negative vote on a request.
///
/// Produced by an approval callback, or synthesized by the engine when a
/// request fails before or during execution. Fields are fixed at
/// construction; clients observe all failures exclusively through this
/// type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dissenter {
    pid: u32,
    status: i32,
    message: Option<String>,
}

impl Dissenter {
    pub fn new(pid: u32, kind: ArbiterErrorKind, message: Option<String>) -> Self {
        Self {
            pid,
            status: kind.code(),
            message,
        }
    }

    /// A dissenter carrying a raw status code, e.g. a helper's exit status.
    pub fn with_status(pid: u32, status: i32, message: Option<String>) -> Self {
        Self {
            pid,
            status,
            message,
        }
    }

    /// Synthesized by the daemon itself (pid 0) from an internal failure.
    pub fn from_error(error: &ArbiterError) -> Self {
        Self {
            pid: 0,
            status: error.kind.code(),
            message: Some(error.message.clone()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_kind(&self, kind: ArbiterErrorKind) -> bool {
        self.status == kind.code()
    }
}
