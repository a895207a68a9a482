//! Source providers: the one readable byte stream behind the capture.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStdout, Command};

use crate::capture::SourceReader;
use crate::error::{RelayError, Result};

// ── Process launcher ────────────────────────────────────────────────

/// A started subprocess with its stdout pipe split off.
pub struct Launched {
    pub stdout: ChildStdout,
    pub child: Child,
}

impl Launched {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

fn command_for(argv: &[String]) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}

/// Starts `argv` with stdout piped. Fails before anything is readable if
/// the process cannot be started.
pub fn launch(argv: &[String]) -> Result<Launched> {
    if argv.is_empty() {
        return Err(RelayError::launch(
            argv,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        ));
    }

    let mut child = command_for(argv)
        .spawn()
        .map_err(|e| RelayError::launch(argv, e))?;
    let stdout = child.stdout.take().ok_or_else(|| {
        RelayError::launch(
            argv,
            std::io::Error::new(std::io::ErrorKind::Other, "stdout was not piped"),
        )
    })?;

    tracing::debug!(command = %argv.join(" "), pid = ?child.id(), "launched");
    Ok(Launched { stdout, child })
}

/// Runs `argv` to completion and collects its stdout. The status is
/// `None` when the process launched but could not be waited on.
pub async fn run_to_end(argv: &[String]) -> Result<(Vec<u8>, Option<ExitStatus>)> {
    let Launched { mut stdout, mut child } = launch(argv)?;
    let mut out = Vec::new();
    // Read before waiting so a full pipe cannot deadlock the child.
    let copied = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut out).await;
    let status = exit_status(child.wait().await, &argv.join(" "));
    if let Err(err) = copied {
        tracing::warn!(error = %err, "reading command output failed");
    }
    Ok((out, status))
}

/// Logs a failed wait instead of failing a request whose process already ran.
fn exit_status(waited: std::io::Result<ExitStatus>, command: &str) -> Option<ExitStatus> {
    match waited {
        Ok(status) => Some(status),
        Err(err) => {
            tracing::warn!(%command, error = %err, "failed to wait on command");
            None
        }
    }
}

/// Shell-style exit code: the code, or 128 + signal.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(sig) = status.signal() {
        128 + sig
    } else {
        -1
    }
}

/// Waits for `child` in the background. The outcome is only logged.
pub fn spawn_reaper(mut child: Child, command: String) {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::debug!(%command, "source process exited cleanly");
            }
            Ok(status) => {
                tracing::warn!(%command, code = exit_code(&status), "source process exited with failure");
            }
            Err(err) => {
                tracing::warn!(%command, error = %err, "failed to wait on source process");
            }
        }
    });
}

// ── Source provider ─────────────────────────────────────────────────

pub enum SourceProvider {
    /// The server's own standard input.
    Stdin,
    /// A command started once, its stdout shared by all clients.
    Command(Vec<String>),
}

/// An opened source plus, for commands, the pid to signal on shutdown.
pub struct OpenedSource {
    pub reader: SourceReader,
    pub pid: Option<u32>,
}

impl SourceProvider {
    pub fn open(self) -> Result<OpenedSource> {
        match self {
            Self::Stdin => Ok(OpenedSource {
                reader: Box::new(tokio::io::stdin()),
                pid: None,
            }),
            Self::Command(argv) => {
                let launched = launch(&argv)?;
                let pid = launched.pid();
                spawn_reaper(launched.child, argv.join(" "));
                Ok(OpenedSource {
                    reader: Box::new(launched.stdout),
                    pid,
                })
            }
        }
    }
}

/// Asks a still-running source process to stop.
pub fn terminate(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => tracing::debug!(pid, "sent SIGTERM to source process"),
        // ESRCH: already reaped.
        Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => tracing::warn!(pid, error = %err, "failed to signal source process"),
    }
}
