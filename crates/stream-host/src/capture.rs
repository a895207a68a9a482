//! Capture buffer: wraps the read-once source and records what it yields.
//!
//! The status lives in a `watch` channel so the broadcaster can read it
//! without touching the drain lock, claim the drain atomically, and wait
//! for the one-shot `Captured` transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{watch, Mutex};

use crate::error::{RelayError, Result};

/// The boxed source every provider hands to the capture buffer.
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CaptureStatus {
    /// Nobody has read the source yet.
    Initial,
    /// A connection is reading the source.
    Draining,
    /// The source hit EOF; captured bytes are frozen.
    Captured,
}

/// Moves `status` forward to `next`. Never goes backwards.
fn advance(status: &watch::Sender<CaptureStatus>, next: CaptureStatus) -> bool {
    status.send_if_modified(|current| {
        if next > *current {
            *current = next;
            true
        } else {
            false
        }
    })
}

// ── Capture buffer ──────────────────────────────────────────────────

struct DrainState {
    /// Dropped once the source reports EOF so it can never be read again.
    source: Option<SourceReader>,
    live: BytesMut,
}

pub struct CaptureBuffer {
    drain: Mutex<DrainState>,
    status: watch::Sender<CaptureStatus>,
    captured: OnceLock<Bytes>,
    /// When false the drain is still serialized but nothing is kept.
    retain: bool,
    bytes_read: AtomicU64,
}

impl CaptureBuffer {
    /// Capture that keeps every byte for replay.
    pub fn persistent(source: SourceReader) -> Self {
        Self::new(source, true)
    }

    /// Capture that tracks status only; a late client gets an empty replay.
    pub fn passthrough(source: SourceReader) -> Self {
        Self::new(source, false)
    }

    fn new(source: SourceReader, retain: bool) -> Self {
        let (status, _) = watch::channel(CaptureStatus::Initial);
        Self {
            drain: Mutex::new(DrainState {
                source: Some(source),
                live: BytesMut::new(),
            }),
            status,
            captured: OnceLock::new(),
            retain,
            bytes_read: AtomicU64::new(0),
        }
    }

    pub fn retains(&self) -> bool {
        self.retain
    }

    pub fn status_now(&self) -> CaptureStatus {
        *self.status.borrow()
    }

    /// Total bytes pulled from the underlying source so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Atomically moves `Initial → Draining`. Returns true for exactly one
    /// caller over the lifetime of the buffer.
    pub fn try_claim(&self) -> bool {
        self.status.send_if_modified(|current| {
            if *current == CaptureStatus::Initial {
                *current = CaptureStatus::Draining;
                true
            } else {
                false
            }
        })
    }

    /// Suspends until the buffer reaches `Captured`. If the drain was
    /// abandoned this never returns.
    pub async fn wait_captured(&self) {
        let mut rx = self.status.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|s| *s == CaptureStatus::Captured).await;
    }

    /// Reads the next chunk of the source into `buf`.
    ///
    /// Returns `Ok(0)` at EOF, for an empty `buf`, and on every call after
    /// capture completed.
    /// The lock is held for this one read, not the whole drain.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut drain = self.drain.lock().await;
        if self.status_now() == CaptureStatus::Captured || buf.is_empty() {
            return Ok(0);
        }
        advance(&self.status, CaptureStatus::Draining);

        let Some(source) = drain.source.as_mut() else {
            return Ok(0);
        };
        // On error the status stays `Draining`.
        let n = source.read(buf).await.map_err(RelayError::SourceRead)?;

        if n == 0 {
            let live = std::mem::take(&mut drain.live);
            drain.source = None;
            let _ = self.captured.set(live.freeze());
            advance(&self.status, CaptureStatus::Captured);
            tracing::debug!(bytes = self.bytes_read(), retained = self.retain, "source captured");
            return Ok(0);
        }

        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        if self.retain {
            drain.live.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }

    /// Independent handle on the captured bytes, `None` until captured.
    pub fn snapshot(&self) -> Option<Bytes> {
        if self.status_now() != CaptureStatus::Captured {
            return None;
        }
        self.captured.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    fn source_from(data: &'static [u8]) -> SourceReader {
        Box::new(data)
    }

    async fn drain_all(capture: &CaptureBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = capture.read(&mut buf).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Yields a fixed prefix, then fails.
    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.sent {
                self.sent = true;
                buf.put_slice(b"partial");
                return Poll::Ready(Ok(()));
            }
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "source broke")))
        }
    }

    #[tokio::test]
    async fn starts_initial_with_no_snapshot() {
        let capture = CaptureBuffer::persistent(source_from(b"abc"));
        assert_eq!(capture.status_now(), CaptureStatus::Initial);
        assert!(capture.snapshot().is_none());
        assert_eq!(capture.bytes_read(), 0);
    }

    #[tokio::test]
    async fn read_to_eof_captures_everything() {
        let capture = CaptureBuffer::persistent(source_from(b"hello world"));
        let out = drain_all(&capture).await;

        assert_eq!(out, b"hello world");
        assert_eq!(capture.status_now(), CaptureStatus::Captured);
        assert_eq!(capture.snapshot().unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(capture.bytes_read(), 11);
    }

    #[tokio::test]
    async fn read_after_capture_is_eof() {
        let capture = CaptureBuffer::persistent(source_from(b"abc"));
        drain_all(&capture).await;

        let mut buf = [0u8; 16];
        assert_eq!(capture.read(&mut buf).await.unwrap(), 0);
        assert_eq!(capture.read(&mut buf).await.unwrap(), 0);
        assert_eq!(capture.bytes_read(), 3);
    }

    #[tokio::test]
    async fn first_read_moves_to_draining() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let capture = CaptureBuffer::persistent(Box::new(rx));
        tx.write_all(b"ab").await.unwrap();

        let mut buf = [0u8; 16];
        let n = capture.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ab");
        assert_eq!(capture.status_now(), CaptureStatus::Draining);
        assert!(capture.snapshot().is_none());

        drop(tx);
        assert_eq!(capture.read(&mut buf).await.unwrap(), 0);
        assert_eq!(capture.status_now(), CaptureStatus::Captured);
    }

    #[tokio::test]
    async fn empty_buffer_does_not_end_capture() {
        let capture = CaptureBuffer::persistent(source_from(b"hello"));
        assert_eq!(capture.read(&mut [0u8; 0]).await.unwrap(), 0);
        assert_eq!(capture.status_now(), CaptureStatus::Initial);
        assert!(capture.snapshot().is_none());

        assert_eq!(drain_all(&capture).await, b"hello");
        assert_eq!(capture.snapshot().unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn snapshots_are_independent() {
        let capture = CaptureBuffer::persistent(source_from(b"replay me"));
        drain_all(&capture).await;

        let first = capture.snapshot().unwrap();
        let second = capture.snapshot().unwrap();
        assert_eq!(first, second);
        drop(first);
        assert_eq!(&second[..], b"replay me");
    }

    #[tokio::test]
    async fn passthrough_keeps_nothing() {
        let capture = CaptureBuffer::passthrough(source_from(b"abc"));
        let out = drain_all(&capture).await;

        assert_eq!(out, b"abc");
        assert_eq!(capture.status_now(), CaptureStatus::Captured);
        assert!(capture.snapshot().unwrap().is_empty());
        assert!(!capture.retains());
    }

    #[tokio::test]
    async fn claim_is_won_once() {
        let capture = CaptureBuffer::persistent(source_from(b""));
        assert!(capture.try_claim());
        assert!(!capture.try_claim());
        assert_eq!(capture.status_now(), CaptureStatus::Draining);
    }

    #[tokio::test]
    async fn source_error_leaves_buffer_draining() {
        let capture = CaptureBuffer::persistent(Box::new(FailingReader { sent: false }));
        let mut buf = [0u8; 32];
        assert_eq!(capture.read(&mut buf).await.unwrap(), 7);

        let err = capture.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, RelayError::SourceRead(_)));
        assert_eq!(capture.status_now(), CaptureStatus::Draining);
        assert!(capture.snapshot().is_none());
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let capture = CaptureBuffer::persistent(source_from(b"x"));
        let mut rx = capture.status.subscribe();
        let mut seen = vec![*rx.borrow_and_update()];

        let watcher = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                seen.push(*rx.borrow_and_update());
                if seen.last() == Some(&CaptureStatus::Captured) {
                    break;
                }
            }
            seen
        });

        drain_all(&capture).await;
        assert!(!capture.try_claim());
        assert!(!advance(&capture.status, CaptureStatus::Initial));

        let seen = watcher.await.unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "got {seen:?}");
        assert_eq!(seen.last(), Some(&CaptureStatus::Captured));
    }

    #[tokio::test]
    async fn wait_captured_wakes_on_completion() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let capture = std::sync::Arc::new(CaptureBuffer::persistent(Box::new(rx)));

        let waiter = {
            let capture = capture.clone();
            tokio::spawn(async move {
                capture.wait_captured().await;
                capture.snapshot().unwrap()
            })
        };

        tx.write_all(b"done").await.unwrap();
        drop(tx);
        drain_all(&capture).await;

        assert_eq!(&waiter.await.unwrap()[..], b"done");
    }
}
