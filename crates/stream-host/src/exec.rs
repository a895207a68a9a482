//! Per-request executor: a fresh subprocess for every client.

use clap::ValueEnum;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, Result};
use crate::source::{self, exit_code, Launched};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ExecStrategy {
    /// Answer at once and pipe stdout into the response as it is produced.
    #[default]
    Stream,
    /// Run the command to completion, then answer with all of its output.
    Buffer,
}

pub struct Executor {
    argv: Vec<String>,
    strategy: ExecStrategy,
}

impl Executor {
    pub fn new(argv: Vec<String>, strategy: ExecStrategy) -> Self {
        Self { argv, strategy }
    }

    pub fn strategy(&self) -> ExecStrategy {
        self.strategy
    }

    pub fn command(&self) -> String {
        self.argv.join(" ")
    }

    /// Starts a new invocation. Nothing is shared with other requests.
    pub fn launch(&self) -> Result<Launched> {
        source::launch(&self.argv)
    }

    /// Copies the invocation's stdout into `sink`, then waits for it.
    ///
    /// Copy and wait failures are logged separately; only the copy
    /// outcome is returned since the response status is already sent.
    pub async fn pump<W>(&self, launched: Launched, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let Launched { mut stdout, mut child } = launched;
        let pid = child.id();

        let copied = tokio::io::copy(&mut stdout, sink).await;
        let copied = match copied {
            Ok(n) => sink.flush().await.map(|_| n),
            Err(err) => Err(err),
        };
        // Close our end so a child still writing sees EPIPE rather than blocking.
        drop(stdout);

        match child.wait().await {
            Ok(status) if !status.success() => {
                tracing::warn!(command = %self.command(), ?pid, code = exit_code(&status), "command exited with failure");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(command = %self.command(), ?pid, error = %err, "failed to wait on command");
            }
        }

        match copied {
            Ok(n) => {
                tracing::debug!(command = %self.command(), ?pid, bytes = n, "streamed command output");
                Ok(n)
            }
            Err(err) => {
                tracing::warn!(command = %self.command(), ?pid, error = %err, "streaming command output failed");
                Err(RelayError::SinkWrite(err))
            }
        }
    }

    /// Launches and streams in one step, for transports that have a sink
    /// before they need to know whether the launch worked.
    pub async fn serve<W>(&self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let launched = self.launch()?;
        self.pump(launched, sink).await
    }

    /// Runs the command to completion and returns everything it printed.
    pub async fn run_buffered(&self) -> Result<Vec<u8>> {
        let (out, status) = source::run_to_end(&self.argv).await?;
        if let Some(status) = status.filter(|s| !s.success()) {
            tracing::warn!(command = %self.command(), code = exit_code(&status), "command exited with failure");
        }
        Ok(out)
    }
}
