// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes a client can observe.
///
/// Every failure a caller sees is one of these kinds, carried inside a
/// [`crate::Dissenter`] on the operation's normal completion path. There is
/// no separate error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterErrorKind {
    BadArgument,
    NotPrivileged,
    Busy,
    Unsupported,
    NotFound,
    IoFailure,
    Timeout,
}

impl ArbiterErrorKind {
    /// Stable numeric status, used as the dissenter status code.
    pub fn code(self) -> i32 {
        match self {
            Self::BadArgument => 400,
            Self::NotPrivileged => 403,
            Self::NotFound => 404,
            Self::Busy => 423,
            Self::IoFailure => 500,
            Self::Unsupported => 501,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ArbiterError {
    pub kind: ArbiterErrorKind,
    pub message: String,
}

impl ArbiterError {
    pub fn new(kind: ArbiterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_argument(message: impl Into<String>) -> Self {
        Self::new(ArbiterErrorKind::BadArgument, message)
    }

    pub fn not_privileged(message: impl Into<String>) -> Self {
        Self::new(ArbiterErrorKind::NotPrivileged, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ArbiterErrorKind::Busy, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ArbiterErrorKind::Unsupported, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ArbiterErrorKind::NotFound, message)
    }

    pub fn io_failure(message: impl Into<String>) -> Self {
        Self::new(ArbiterErrorKind::IoFailure, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbiter_error_roundtrips() {
        let error = ArbiterError::new(ArbiterErrorKind::Busy, "disk already claimed");
        let json = serde_json::to_string(&error).expect("serialize error");
        let parsed: ArbiterError = serde_json::from_str(&json).expect("deserialize error");
        assert_eq!(parsed, error);
    }

    #[test]
    fn error_kind_status_codes_are_stable() {
        assert_eq!(ArbiterErrorKind::BadArgument.code(), 400);
        assert_eq!(ArbiterErrorKind::NotPrivileged.code(), 403);
        assert_eq!(ArbiterErrorKind::NotFound.code(), 404);
        assert_eq!(ArbiterErrorKind::Busy.code(), 423);
        assert_eq!(ArbiterErrorKind::IoFailure.code(), 500);
        assert_eq!(ArbiterErrorKind::Unsupported.code(), 501);
        assert_eq!(ArbiterErrorKind::Timeout.code(), 504);
    }
}
