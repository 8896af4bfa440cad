// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the disk-arbiter daemon
//!
//! This crate defines the single source of truth for the arbitration domain:
//!
//! - **arbiter-core**: mutates these models on the engine task and hands out
//!   immutable snapshots
//! - **arbiter-daemon**: serializes these models for D-Bus transport
//! - clients consume snapshots and dissenters, never live state
//!
//! Everything here is plain data: no I/O, no process state.

pub mod disk;
pub mod dissenter;
pub mod error;
pub mod events;
pub mod id;
pub mod request;

pub use disk::{DiskDescription, DiskId, DiskOption, DiskStage, UID_UNKNOWN, keys};
pub use dissenter::Dissenter;
pub use error::{ArbiterError, ArbiterErrorKind};
pub use events::{CallbackKind, DiskEvent, DiskSnapshot};
pub use id::{CallbackToken, RequestId, RoundId, SessionId};
pub use request::{OperationFlags, Request, RequestKind};
