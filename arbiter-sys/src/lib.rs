// SPDX-License-Identifier: GPL-3.0-only

//! Low-level process execution for the disk-arbiter daemon
//!
//! This crate runs external helpers (filesystem probes, mount tools, media
//! eject) as child processes, optionally dropping to a target uid/gid and
//! capturing their standard output. Child exits are observed through the
//! async runtime's reactor, never through a signal handler; every execution
//! resolves exactly once.
//!
//! These operations may require elevated privileges and should only be
//! called from the arbitration engine.

pub mod command;
pub mod eject;
pub mod error;

pub use command::{CommandOutcome, CommandRunner, CommandSpec, STATUS_SPAWN_FAILED};
pub use eject::eject_spec;
pub use error::{Result, SysError};
