// SPDX-License-Identifier: GPL-3.0-only

//! Authorization policy for arbitration requests.
//!
//! The fast paths (root, admin group, disk owner) are decided locally on
//! the engine task; anything else goes through the [`Authorizer`] seam,
//! which the daemon implements with an interactive rights check. Any
//! definitive failure from that check is normalized to `NotPrivileged`.

use async_trait::async_trait;

use arbiter_types::{ArbiterError, RequestKind};

use crate::session::CallerIdentity;

/// Rights the policy table demands per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Right {
    Mount,
    Unmount,
    Rename,
}

/// The right a request kind requires, if any. Claim and release are gated
/// at queue level, probe and refresh are unprivileged.
pub fn required_right(kind: RequestKind) -> Option<Right> {
    match kind {
        RequestKind::Mount => Some(Right::Mount),
        RequestKind::Unmount | RequestKind::Eject => Some(Right::Unmount),
        RequestKind::Rename => Some(Right::Rename),
        RequestKind::Claim | RequestKind::Release | RequestKind::Probe | RequestKind::Refresh => {
            None
        }
    }
}

/// Interactive rights check against a session's capability handle.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// May prompt or extend rights; returns whether the caller holds the
    /// right. Errors are treated as a definitive denial by the engine.
    async fn check(&self, caller: &CallerIdentity, right: Right) -> Result<bool, ArbiterError>;
}

/// Fixed-answer authorizer, for tests and permissive deployments.
#[derive(Debug, Clone, Copy)]
pub struct StaticAuthorizer {
    allow: bool,
}

impl StaticAuthorizer {
    pub fn allow_all() -> Self {
        Self { allow: true }
    }

    pub fn deny_all() -> Self {
        Self { allow: false }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn check(&self, _caller: &CallerIdentity, _right: Right) -> Result<bool, ArbiterError> {
        Ok(self.allow)
    }
}

/// Whether the caller belongs to the named admin group, either as its
/// primary group or through the member list.
pub fn is_admin_group_member(caller: &CallerIdentity, group_name: &str) -> bool {
    let Ok(Some(group)) = nix::unistd::Group::from_name(group_name) else {
        return false;
    };
    if group.gid.as_raw() == caller.gid {
        return true;
    }
    let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(caller.uid)) else {
        return false;
    };
    group.mem.iter().any(|member| *member == user.name)
}
