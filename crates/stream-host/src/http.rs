//! Plain HTTP transport: `GET /` answers 200 at once and streams the body.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::DuplexStream;
use tokio_util::io::ReaderStream;

use crate::broadcast::Broadcaster;
use crate::error::{RelayError, Result};
use crate::exec::{ExecStrategy, Executor};
use crate::server::{AppState, Engine};

/// Bytes buffered between the copy task and the response body. Small on
/// purpose: a slow client pushes back on whoever is writing.
const PIPE_CAPACITY: usize = 64 * 1024;

pub const GZIP_THRESHOLD: usize = 4096;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

pub async fn stream(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    match state.engine {
        Engine::Shared(broadcaster) => {
            let gzip = state.gzip_replay && accepts_gzip(&headers);
            Ok(shared_response(broadcaster, gzip))
        }
        Engine::Exec(executor) => exec_response(executor).await,
    }
}

/// Anything but GET (and HEAD, which would otherwise run GET and throw the
/// body away mid-drain).
pub async fn reject(method: Method) -> RelayError {
    RelayError::MethodNotAllowed(method)
}

fn shared_response(broadcaster: Arc<Broadcaster>, gzip: bool) -> Response {
    if gzip {
        if let Some(compressed) = broadcaster
            .capture()
            .snapshot()
            .and_then(|snapshot| gzip_if_smaller(&snapshot))
        {
            return (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, TEXT_PLAIN),
                    (header::CONTENT_ENCODING, "gzip"),
                ],
                compressed,
            )
                .into_response();
        }
    }

    piped_response(move |mut sink| async move {
        if let Ok(outcome) = broadcaster.serve(&mut sink).await {
            tracing::debug!(?outcome, "http client served");
        }
    })
}

async fn exec_response(executor: Arc<Executor>) -> Result<Response> {
    match executor.strategy() {
        ExecStrategy::Buffer => {
            let out = executor.run_buffered().await?;
            Ok(ok_response(Body::from(out)))
        }
        ExecStrategy::Stream => {
            // Launch before answering so a failure can still become a 500.
            let launched = executor.launch()?;
            Ok(piped_response(move |mut sink| async move {
                let _ = executor.pump(launched, &mut sink).await;
            }))
        }
    }
}

/// Answers 200 now and lets `copy` write the body from a spawned task.
/// When the client goes away the pipe breaks and `copy` sees a write error.
fn piped_response<F, Fut>(copy: F) -> Response
where
    F: FnOnce(DuplexStream) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(copy(writer));
    ok_response(Body::from_stream(ReaderStream::new(reader)))
}

fn ok_response(body: Body) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| {
            let mut parts = coding.split(';').map(str::trim);
            let name = parts.next().unwrap_or_default();
            let refused = parts.any(|p| p.replace(' ', "") == "q=0");
            name.eq_ignore_ascii_case("gzip") && !refused
        })
}

/// Gzips `data` if it is large enough to bother and actually shrinks.
fn gzip_if_smaller(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < GZIP_THRESHOLD {
        return None;
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).ok()?;
    let compressed = encoder.finish().ok()?;
    (compressed.len() < data.len()).then_some(compressed)
}
