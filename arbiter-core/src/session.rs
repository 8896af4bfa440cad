// SPDX-License-Identifier: GPL-3.0-only

//! Per-client session state and callback routing.

use tokio::sync::mpsc;

use arbiter_types::{CallbackKind, CallbackToken, DiskDescription, DiskEvent, SessionId};

use crate::disk::Disk;

/// Identity of the process behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl CallerIdentity {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            pid: std::process::id(),
        }
    }
}

/// What a client asks for when registering a callback.
#[derive(Debug, Clone)]
pub struct CallbackSpec {
    pub kind: CallbackKind,
    pub order: i32,
    /// Caller-chosen tag; `unregister_context` removes every callback
    /// sharing it.
    pub context: Option<String>,
    pub match_predicate: Option<DiskDescription>,
    pub watch_keys: Option<Vec<String>>,
}

impl CallbackSpec {
    pub fn for_kind(kind: CallbackKind) -> Self {
        Self {
            kind,
            order: 0,
            context: None,
            match_predicate: None,
            watch_keys: None,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_predicate(mut self, predicate: DiskDescription) -> Self {
        self.match_predicate = Some(predicate);
        self
    }

    pub fn with_watch_keys(mut self, keys: Vec<String>) -> Self {
        self.watch_keys = Some(keys);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredCallback {
    pub token: CallbackToken,
    pub kind: CallbackKind,
    pub order: i32,
    /// Insertion order within the session; the ordering tie-break.
    pub registration: u64,
    pub context: Option<String>,
    pub match_predicate: Option<DiskDescription>,
    pub watch_keys: Option<Vec<String>>,
}

impl RegisteredCallback {
    /// Whether this callback wants events for `disk`, optionally filtered
    /// by the changed-key list of a description change.
    pub fn wants(&self, disk: &Disk, changed_keys: Option<&[String]>) -> bool {
        if let Some(predicate) = &self.match_predicate {
            if !disk.matches(predicate) {
                return false;
            }
        }
        if let (Some(watch), Some(changed)) = (&self.watch_keys, changed_keys) {
            if !changed.iter().any(|key| watch.contains(key)) {
                return false;
            }
        }
        true
    }
}

/// One connected client: its event channel, registered callbacks, and
/// authorization capability marker.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    pub caller: CallerIdentity,
    /// Whether the client presented an authorization-rights capability.
    pub has_rights: bool,
    sender: mpsc::UnboundedSender<DiskEvent>,
    callbacks: Vec<RegisteredCallback>,
}

impl Session {
    pub fn new(
        id: SessionId,
        caller: CallerIdentity,
        has_rights: bool,
        sender: mpsc::UnboundedSender<DiskEvent>,
    ) -> Self {
        Self {
            id,
            caller,
            has_rights,
            sender,
            callbacks: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Deliver an event; delivery to a disconnected client is a no-op.
    pub fn send(&self, event: DiskEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    /// `registration` is the engine-wide monotonic insertion number; it
    /// breaks ordering ties across sessions.
    pub fn register(&mut self, spec: CallbackSpec, registration: u64) -> CallbackToken {
        let token = CallbackToken::new();
        self.callbacks.push(RegisteredCallback {
            token,
            kind: spec.kind,
            order: spec.order,
            registration,
            context: spec.context,
            match_predicate: spec.match_predicate,
            watch_keys: spec.watch_keys,
        });
        token
    }

    /// Remove one callback by token. Returns whether it existed.
    pub fn unregister(&mut self, token: CallbackToken) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|callback| callback.token != token);
        self.callbacks.len() != before
    }

    /// Remove every callback sharing a context tag. Returns how many went.
    pub fn unregister_context(&mut self, context: &str) -> usize {
        let before = self.callbacks.len();
        self.callbacks
            .retain(|callback| callback.context.as_deref() != Some(context));
        before - self.callbacks.len()
    }

    pub fn callbacks(&self) -> &[RegisteredCallback] {
        &self.callbacks
    }

    pub fn find_callback(&self, token: CallbackToken) -> Option<&RegisteredCallback> {
        self.callbacks
            .iter()
            .find(|callback| callback.token == token)
    }

    /// The session's first callback of a kind, lowest (order, registration).
    pub fn first_of_kind(&self, kind: CallbackKind) -> Option<&RegisteredCallback> {
        self.callbacks
            .iter()
            .filter(|callback| callback.kind == kind)
            .min_by_key(|callback| (callback.order, callback.registration))
    }

    /// Callbacks of a kind in dispatch order: (order, registration) for
    /// ordered kinds, registration order otherwise.
    pub fn ordered_callbacks(&self, kind: CallbackKind) -> Vec<&RegisteredCallback> {
        let mut matching: Vec<&RegisteredCallback> = self
            .callbacks
            .iter()
            .filter(|callback| callback.kind == kind)
            .collect();
        if kind.is_ordered() {
            matching.sort_by_key(|callback| (callback.order, callback.registration));
        } else {
            matching.sort_by_key(|callback| callback.registration);
        }
        matching
    }
}
