// SPDX-License-Identifier: GPL-3.0-only

//! External command execution with per-child tracking.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Status reported when the child could not be spawned at all, including
/// uid/gid drop failures surfaced before the target executable runs.
/// Negative, so it can never collide with a real exit code (0..=255) or a
/// signal death (128 + signal).
pub const STATUS_SPAWN_FAILED: i32 = -1;

/// One external command to run, built as a typed argument sequence.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    executable: PathBuf,
    args: Vec<OsString>,
    uid: Option<u32>,
    gid: Option<u32>,
    capture_output: bool,
}

impl CommandSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            uid: None,
            gid: None,
            capture_output: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the child under the given uid/gid instead of the daemon's own.
    pub fn run_as(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Redirect the child's stdout into a pipe and capture it to EOF.
    pub fn capture_output(mut self) -> Self {
        self.capture_output = true;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn rendered(&self) -> String {
        let mut out = self.executable.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

/// Result of one execution. Delivered exactly once per [`CommandRunner::execute`].
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub pid: u32,
    pub status: i32,
    pub stdout: Option<Vec<u8>>,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_text(&self) -> Option<String> {
        self.stdout
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
    }
}

/// Runs external helpers and tracks each live child by pid.
///
/// Concurrent executions are independent: each call owns its child handle,
/// so a late-exiting child never delays or misattributes another child's
/// completion.
#[derive(Debug, Default)]
pub struct CommandRunner {
    jobs: Mutex<HashMap<u32, String>>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pids of children currently running, for diagnostics.
    pub fn active_pids(&self) -> Vec<u32> {
        let jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.keys().copied().collect()
    }

    /// Spawn the command and resolve with its outcome.
    ///
    /// Never returns an error: spawn failures resolve immediately with
    /// [`STATUS_SPAWN_FAILED`] and no output. A child killed by a signal
    /// reports `128 + signal`. Captured output is complete to the pipe's
    /// write-end EOF.
    pub async fn execute(&self, spec: CommandSpec) -> CommandOutcome {
        let rendered = spec.rendered();
        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .stdout(if spec.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(uid) = spec.uid {
            command.uid(uid);
        }
        if let Some(gid) = spec.gid {
            command.gid(gid);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::warn!("failed to spawn `{rendered}`: {error}");
                return CommandOutcome {
                    pid: 0,
                    status: STATUS_SPAWN_FAILED,
                    stdout: None,
                };
            }
        };

        let pid = child.id().unwrap_or(0);
        {
            let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            jobs.insert(pid, rendered.clone());
        }
        tracing::debug!("spawned `{rendered}` as pid {pid}");

        // Drain stdout to EOF before reaping; the pipe closes when the
        // child (and any inheritors of the write end) exit.
        let stdout = match child.stdout.take() {
            Some(mut pipe) => {
                let mut buffer = Vec::new();
                if let Err(error) = pipe.read_to_end(&mut buffer).await {
                    tracing::warn!("failed to read output of pid {pid}: {error}");
                }
                Some(buffer)
            }
            None => None,
        };

        let status = match child.wait().await {
            Ok(status) => match status.code() {
                Some(code) => code,
                None => 128 + status.signal().unwrap_or(0),
            },
            Err(error) => {
                tracing::warn!("failed to reap pid {pid}: {error}");
                STATUS_SPAWN_FAILED
            }
        };

        {
            let mut jobs = self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            jobs.remove(&pid);
        }
        tracing::debug!("pid {pid} exited with status {status}");

        CommandOutcome {
            pid,
            status,
            stdout,
        }
    }
}
