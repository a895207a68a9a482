//! Replay broadcaster: per connection, drain the live source or replay
//! the captured bytes.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::capture::{CaptureBuffer, CaptureStatus};
use crate::error::{RelayError, Result};

const CHUNK_SIZE: usize = 65536;

/// Local copy of the first drain, e.g. the server's stdout.
pub type TeeSink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// This connection performed the live drain.
    Drained(u64),
    /// This connection was served the captured bytes.
    Replayed(u64),
}

pub struct Broadcaster {
    capture: CaptureBuffer,
    /// Taken by the single draining connection, so it is written at most once.
    tee: Mutex<Option<TeeSink>>,
}

impl Broadcaster {
    pub fn new(capture: CaptureBuffer, tee: Option<TeeSink>) -> Self {
        Self {
            capture,
            tee: Mutex::new(tee),
        }
    }

    pub fn capture(&self) -> &CaptureBuffer {
        &self.capture
    }

    /// Copies the stream to `sink`, live or replayed depending on status.
    pub async fn serve<W>(&self, sink: &mut W) -> Result<ServeOutcome>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            match self.capture.status_now() {
                CaptureStatus::Captured => return self.replay(sink).await,
                CaptureStatus::Initial => {
                    if self.capture.try_claim() {
                        return self.drain(sink).await;
                    }
                    // Lost the race; re-check.
                }
                CaptureStatus::Draining => {
                    tracing::debug!("drain in progress, waiting for capture");
                    self.capture.wait_captured().await;
                }
            }
        }
    }

    async fn drain<W>(&self, sink: &mut W) -> Result<ServeOutcome>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut tee = self.tee.lock().await.take();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = match self.capture.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(error = %err, sent = total, "source read failed, capture cannot complete");
                    return Err(err);
                }
            };
            let chunk = &buf[..n];

            if let Err(err) = sink.write_all(chunk).await {
                tracing::warn!(error = %err, sent = total, "client went away mid-drain, capture cannot complete");
                return Err(RelayError::SinkWrite(err));
            }
            if let Some(out) = tee.as_mut() {
                if let Err(err) = write_flush(out.as_mut(), chunk).await {
                    tracing::warn!(error = %err, "tee write failed, disabling tee");
                    tee = None;
                }
            }
            sink.flush().await.map_err(RelayError::SinkWrite)?;
            total += n as u64;
        }

        if let Some(mut out) = tee {
            let _ = out.shutdown().await;
        }
        tracing::info!(bytes = total, "drained source");
        Ok(ServeOutcome::Drained(total))
    }

    async fn replay<W>(&self, sink: &mut W) -> Result<ServeOutcome>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let snapshot = self.capture.snapshot().unwrap_or_default();
        write_flush(sink, &snapshot)
            .await
            .map_err(RelayError::SinkWrite)?;
        tracing::debug!(bytes = snapshot.len(), "replayed capture");
        Ok(ServeOutcome::Replayed(snapshot.len() as u64))
    }
}

async fn write_flush<W>(out: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    out.write_all(data).await?;
    out.flush().await
}
