// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem driver: probe, mount, unmount, repair, and rename through a
//! personality's declared tooling.
//!
//! Probing is a three-stage chain (recognize, identify, verify); a hard
//! failure at any stage short-circuits the rest. Each driver call resolves
//! exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use arbiter_sys::{CommandRunner, CommandSpec, STATUS_SPAWN_FAILED};
use arbiter_types::ArbiterError;

use crate::personality::{Personality, ToolSpec};

/// SHA-1 namespace the legacy 64-bit volume ids are hashed under.
const LEGACY_UUID_NAMESPACE: Uuid = Uuid::from_bytes([
    0xB3, 0xE2, 0x0F, 0x39, 0xF2, 0x92, 0x11, 0xD6, 0x97, 0xA4, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC,
]);

const MOUNT_FALLBACK: &str = "/sbin/mount";
const UNMOUNT_FALLBACK: &str = "/sbin/umount";

/// Result of a completed probe chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    /// Clean/dirty status from the verify stage; `None` when the
    /// personality declares no repair tool.
    pub clean: Option<bool>,
    pub volume_name: Option<String>,
    pub volume_kind: String,
    pub volume_uuid: Option<Uuid>,
}

/// Map a get-UUID helper's output line to a volume UUID.
///
/// A proper UUID string passes through. A 16-hex-digit legacy 64-bit id is
/// hashed into the legacy namespace, except the all-zero id which maps to
/// the nil UUID. Anything else is no UUID.
pub fn map_volume_uuid(raw: &str) -> Option<Uuid> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(uuid) = raw.parse::<Uuid>() {
        return Some(uuid);
    }
    if raw.len() == 16 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        if raw.chars().all(|c| c == '0') {
            return Some(Uuid::nil());
        }
        let mut bytes = [0u8; 8];
        for (index, chunk) in raw.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[index] = u8::from_str_radix(pair, 16).ok()?;
        }
        return Some(Uuid::new_v5(&LEGACY_UUID_NAMESPACE, &bytes));
    }
    None
}

/// Join mount option tokens into a single `-o` argument.
///
/// Empty tokens and trailing separators are dropped; `None` when nothing
/// remains.
pub fn join_mount_options<S: AsRef<str>>(tokens: &[S]) -> Option<String> {
    let joined: Vec<&str> = tokens
        .iter()
        .map(|token| token.as_ref().trim_matches(','))
        .filter(|token| !token.is_empty())
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join(","))
    }
}

#[derive(Debug, Clone)]
pub struct FileSystemDriver {
    runner: Arc<CommandRunner>,
}

impl FileSystemDriver {
    pub fn new(runner: Arc<CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &Arc<CommandRunner> {
        &self.runner
    }

    /// Run the probe chain for one personality against a device.
    ///
    /// Stage order is strict: identify never starts before recognize has
    /// completed, verify never before identify. A failed recognize reports
    /// `Unsupported`; tool failures in later stages report `IoFailure`.
    pub async fn probe(
        &self,
        personality: &Personality,
        device: &Path,
    ) -> Result<ProbeOutcome, ArbiterError> {
        let probe = personality.probe.as_ref().ok_or_else(|| {
            ArbiterError::unsupported(format!(
                "personality `{}` declares no probe command",
                personality.name
            ))
        })?;

        // Stage 1: recognize, capturing the volume name.
        let recognize = self
            .runner
            .execute(
                CommandSpec::new(&probe.executable)
                    .args(probe.recognize_args.iter().cloned())
                    .arg(device)
                    .capture_output(),
            )
            .await;
        if recognize.status == STATUS_SPAWN_FAILED {
            return Err(ArbiterError::io_failure(format!(
                "probe tool {} could not be spawned",
                probe.executable.display()
            )));
        }
        if !recognize.success() {
            return Err(ArbiterError::unsupported(format!(
                "`{}` does not recognize {}",
                personality.name,
                device.display()
            )));
        }
        let volume_name = recognize
            .stdout_text()
            .map(|text| text.trim().to_string())
            .filter(|name| !name.is_empty());

        // Stage 2: identify the volume UUID.
        let identify = self
            .runner
            .execute(
                CommandSpec::new(&probe.executable)
                    .args(probe.uuid_args.iter().cloned())
                    .arg(device)
                    .capture_output(),
            )
            .await;
        if identify.status == STATUS_SPAWN_FAILED {
            return Err(ArbiterError::io_failure(format!(
                "probe tool {} could not be spawned",
                probe.executable.display()
            )));
        }
        let volume_uuid = if identify.success() {
            identify
                .stdout_text()
                .as_deref()
                .and_then(map_volume_uuid)
        } else {
            None
        };

        // Stage 3: verify cleanliness, when a repair tool is declared.
        let clean = match personality.repair.as_ref() {
            Some(repair) => {
                let verify = self
                    .runner
                    .execute(
                        CommandSpec::new(&repair.executable)
                            .args(repair.check_args.iter().cloned())
                            .arg(device),
                    )
                    .await;
                if verify.status == 0 {
                    Some(true)
                } else if verify.status == repair.dirty_exit_code {
                    Some(false)
                } else {
                    return Err(ArbiterError::io_failure(format!(
                        "repair tool {} failed with status {} on {}",
                        repair.executable.display(),
                        verify.status,
                        device.display()
                    )));
                }
            }
            None => None,
        };

        Ok(ProbeOutcome {
            clean,
            volume_name,
            volume_kind: personality.kind_name.clone(),
            volume_uuid,
        })
    }

    /// Mount a recognized volume.
    ///
    /// Chooses between the kernel mount path (personalities flagged
    /// `in_process`) and an external mount tool.
    pub async fn mount(
        &self,
        personality: &Personality,
        device: &Path,
        mountpoint: &Path,
        options: &[String],
        run_as: Option<(u32, u32)>,
    ) -> Result<(), ArbiterError> {
        let options = join_mount_options(options);

        if personality.in_process {
            return mount_in_process(personality, device, mountpoint, options.as_deref());
        }

        let mut spec = match personality.mount.as_ref() {
            Some(tool) => CommandSpec::new(&tool.executable).args(tool.args.iter().cloned()),
            None => CommandSpec::new(MOUNT_FALLBACK)
                .arg("-t")
                .arg(&personality.name),
        };
        if let Some(options) = options.as_deref() {
            spec = spec.arg("-o").arg(options);
        }
        spec = spec.arg(device).arg(mountpoint);
        if let Some((uid, gid)) = run_as {
            spec = spec.run_as(uid, gid);
        }

        let outcome = self.runner.execute(spec).await;
        if outcome.success() {
            Ok(())
        } else {
            Err(ArbiterError::io_failure(format!(
                "mount of {} at {} failed with status {}",
                device.display(),
                mountpoint.display(),
                outcome.status
            )))
        }
    }

    /// Unmount a mountpoint via the system umount tool.
    pub async fn unmount(&self, mountpoint: &Path, force: bool) -> Result<(), ArbiterError> {
        let executable =
            which::which("umount").unwrap_or_else(|_| PathBuf::from(UNMOUNT_FALLBACK));
        let mut spec = CommandSpec::new(executable);
        if force {
            spec = spec.arg("-f");
        }
        let outcome = self.runner.execute(spec.arg(mountpoint)).await;
        if outcome.success() {
            Ok(())
        } else {
            Err(ArbiterError::io_failure(format!(
                "unmount of {} failed with status {}",
                mountpoint.display(),
                outcome.status
            )))
        }
    }

    /// Repair a volume with the personality's declared tool in fix mode.
    pub async fn repair(
        &self,
        personality: &Personality,
        device: &Path,
    ) -> Result<(), ArbiterError> {
        let repair = personality.repair.as_ref().ok_or_else(|| {
            ArbiterError::unsupported(format!(
                "personality `{}` declares no repair command",
                personality.name
            ))
        })?;
        let outcome = self
            .runner
            .execute(
                CommandSpec::new(&repair.executable)
                    .args(repair.repair_args.iter().cloned())
                    .arg(device),
            )
            .await;
        if outcome.success() {
            Ok(())
        } else {
            Err(ArbiterError::io_failure(format!(
                "repair of {} failed with status {}",
                device.display(),
                outcome.status
            )))
        }
    }

    /// Rename a volume with the personality's declared tool.
    pub async fn rename(
        &self,
        personality: &Personality,
        device: &Path,
        name: &str,
    ) -> Result<(), ArbiterError> {
        let tool: &ToolSpec = personality.rename.as_ref().ok_or_else(|| {
            ArbiterError::unsupported(format!(
                "personality `{}` declares no rename command",
                personality.name
            ))
        })?;
        let outcome = self
            .runner
            .execute(
                CommandSpec::new(&tool.executable)
                    .args(tool.args.iter().cloned())
                    .arg(device)
                    .arg(name),
            )
            .await;
        if outcome.success() {
            Ok(())
        } else {
            Err(ArbiterError::io_failure(format!(
                "rename of {} failed with status {}",
                device.display(),
                outcome.status
            )))
        }
    }
}

fn mount_in_process(
    personality: &Personality,
    device: &Path,
    mountpoint: &Path,
    options: Option<&str>,
) -> Result<(), ArbiterError> {
    nix::mount::mount(
        Some(device),
        mountpoint,
        Some(personality.name.as_str()),
        nix::mount::MsFlags::empty(),
        options,
    )
    .map_err(|errno| {
        ArbiterError::io_failure(format!(
            "kernel mount of {} at {} failed: {errno}",
            device.display(),
            mountpoint.display()
        ))
    })
}
