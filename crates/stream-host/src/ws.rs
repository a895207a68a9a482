//! WebSocket transport: a small page at `/` that follows `/ws/`.
//!
//! Socket connections run the same broadcaster/executor as plain HTTP,
//! with each chunk sent as one binary frame.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;
use crate::server::{AppState, Engine};

const PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>relay-stream-host</title>
    <style>
      body { margin: 0; background: #111; color: #ddd; }
      pre { margin: 0; padding: 1em; white-space: pre-wrap; word-break: break-all; }
    </style>
  </head>
  <body>
    <pre id="out"></pre>
    <script>
      (function () {
        var out = document.getElementById('out');
        var decoder = new TextDecoder('utf-8');
        var scheme = location.protocol === 'https:' ? 'wss://' : 'ws://';
        var ws = new WebSocket(scheme + location.host + '/ws/');
        ws.binaryType = 'arraybuffer';
        ws.addEventListener('message', function (ev) {
          var text = typeof ev.data === 'string'
            ? ev.data
            : decoder.decode(new Uint8Array(ev.data), { stream: true });
          out.textContent += text;
        });
        ws.addEventListener('close', function () {
          out.textContent += decoder.decode();
        });
      })();
    </script>
  </body>
</html>
"#;

pub async fn page() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        PAGE_HTML,
    )
        .into_response()
}

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| follow(socket, state.engine))
}

async fn follow(socket: WebSocket, engine: Engine) {
    let (sender, _receiver) = socket.split();
    let mut writer = FrameWriter::new(sender);

    match engine.serve(&mut writer).await {
        Ok(sent) => {
            tracing::debug!(sent, "websocket client served");
            let _ = writer.shutdown().await;
        }
        Err(RelayError::Launch { .. }) => {
            let mut sender = writer.into_inner();
            let frame = CloseFrame {
                code: close_code::ERROR,
                reason: "launch failed".into(),
            };
            let _ = sender.send(Message::Close(Some(frame))).await;
        }
        // Already logged where it happened; the socket is likely gone.
        Err(_) => {}
    }
}

// ── Frame writer ────────────────────────────────────────────────────

/// Adapts a sink of WebSocket messages into a byte writer; every write
/// becomes one binary frame.
pub struct FrameWriter<S> {
    sink: S,
}

impl<S> FrameWriter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}

fn broken_pipe<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::BrokenPipe, err)
}

impl<S> AsyncWrite for FrameWriter<S>
where
    S: Sink<Message> + Unpin,
    <S as Sink<Message>>::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.sink.poll_ready_unpin(cx)).map_err(broken_pipe)?;
        self.sink
            .start_send_unpin(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(broken_pipe)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sink.poll_flush_unpin(cx).map_err(broken_pipe)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sink.poll_close_unpin(cx).map_err(broken_pipe)
    }
}
