// SPDX-License-Identifier: GPL-3.0-only

//! Disk arbitration core
//!
//! Everything the daemon does that is not transport lives here:
//!
//! - **personality**: filesystem personality definitions loaded from TOML
//! - **driver**: the probe/mount/unmount/repair/rename tool driver
//! - **disk**: the per-device record (description, stages, claim, owner)
//! - **session**: connected clients and their registered callbacks
//! - **authorize**: local policy plus the pluggable interactive check
//! - **engine**: the actor serializing all of the above
//!
//! The engine owns every disk and session on a single task; clients talk
//! to it through [`ArbitrationHandle`] and [`SessionHandle`].

pub mod authorize;
pub mod disk;
pub mod driver;
pub mod engine;
pub mod personality;
pub mod session;

pub use authorize::{Authorizer, Right, StaticAuthorizer, required_right};
pub use disk::{ClaimHolder, DevicePropertyTable, Disk, Ownership};
pub use driver::{FileSystemDriver, ProbeOutcome};
pub use engine::{ArbitrationHandle, EngineConfig, SessionHandle};
pub use personality::{Personality, PersonalityRegistry};
pub use session::{CallbackSpec, CallerIdentity, RegisteredCallback, Session};
