// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use crate::command::CommandSpec;
use crate::error::{Result, SysError};

const EJECT_FALLBACK: &str = "/usr/bin/eject";

/// Build the media-eject command for a device.
///
/// Locates the system `eject` tool; when `run_as` is set the command runs
/// under that uid/gid instead of the daemon's own.
pub fn eject_spec(device: &Path, run_as: Option<(u32, u32)>) -> Result<CommandSpec> {
    let executable = which::which("eject").unwrap_or_else(|_| PathBuf::from(EJECT_FALLBACK));
    if !executable.exists() {
        return Err(SysError::ToolMissing("eject".to_string()));
    }

    let mut spec = CommandSpec::new(executable).arg(device);
    if let Some((uid, gid)) = run_as {
        spec = spec.run_as(uid, gid);
    }
    Ok(spec)
}
