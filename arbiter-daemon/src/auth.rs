// SPDX-License-Identifier: GPL-3.0-only

//! Polkit-backed interactive rights checks.

use async_trait::async_trait;
use zbus::Connection;
use zbus_polkit::policykit1::{AuthorityProxy, CheckAuthorizationFlags, Subject};

use arbiter_core::{Authorizer, CallerIdentity, Right};
use arbiter_types::ArbiterError;

/// Action id consulted for a right.
fn action_id(right: Right) -> &'static str {
    match right {
        Right::Mount => "org.disk.arbiter.mount",
        Right::Unmount => "org.disk.arbiter.unmount",
        Right::Rename => "org.disk.arbiter.rename",
    }
}

/// Asks the Polkit authority whether a caller holds a right, allowing the
/// agent to prompt. Whether a prompt actually appears is decided by the
/// installed policy file, not by this code.
pub struct PolkitAuthorizer {
    connection: Connection,
}

impl PolkitAuthorizer {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Authorizer for PolkitAuthorizer {
    async fn check(&self, caller: &CallerIdentity, right: Right) -> Result<bool, ArbiterError> {
        let action = action_id(right);
        tracing::debug!("checking polkit action {action} for pid {}", caller.pid);

        let authority = AuthorityProxy::new(&self.connection)
            .await
            .map_err(|error| {
                ArbiterError::io_failure(format!("polkit connection error: {error}"))
            })?;
        let subject = Subject::new_for_owner(caller.pid, None, None).map_err(|error| {
            ArbiterError::io_failure(format!("cannot build polkit subject: {error}"))
        })?;

        let result = authority
            .check_authorization(
                &subject,
                action,
                &std::collections::HashMap::new(),
                CheckAuthorizationFlags::AllowUserInteraction.into(),
                "",
            )
            .await
            .map_err(|error| {
                ArbiterError::io_failure(format!("polkit authorization check failed: {error}"))
            })?;

        tracing::debug!(
            "polkit result for {action}: authorized={}, challenged={}",
            result.is_authorized,
            result.is_challenge
        );
        Ok(result.is_authorized)
    }
}
