//! Server wiring: builds the relay engine, routes, and runs until a
//! shutdown signal plus grace period.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcast::{Broadcaster, ServeOutcome, TeeSink};
use crate::capture::CaptureBuffer;
use crate::config::{Relay, ServeConfig};
use crate::error::Result;
use crate::exec::Executor;
use crate::source::{self, SourceProvider};
use crate::{http, ws};

// ── Engine ──────────────────────────────────────────────────────────

/// What a connection is served from.
#[derive(Clone)]
pub enum Engine {
    /// One source shared by every client, drained once.
    Shared(Arc<Broadcaster>),
    /// A new subprocess per client.
    Exec(Arc<Executor>),
}

impl Engine {
    /// Serves one connection; returns the number of bytes written.
    pub async fn serve<W>(&self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match self {
            Self::Shared(broadcaster) => match broadcaster.serve(sink).await? {
                ServeOutcome::Drained(n) | ServeOutcome::Replayed(n) => Ok(n),
            },
            Self::Exec(executor) => executor.serve(sink).await,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub gzip_replay: bool,
}

/// Opens the source (if any) and builds the shared state. Also returns
/// the pid of a shared command so it can be stopped on shutdown.
pub fn build_state(config: &ServeConfig) -> Result<(AppState, Option<u32>)> {
    let (engine, pid) = match &config.relay {
        Relay::Exec { argv, strategy } => {
            let executor = Executor::new(argv.clone(), *strategy);
            (Engine::Exec(Arc::new(executor)), None)
        }
        Relay::Stdin => shared(SourceProvider::Stdin, config)?,
        Relay::Command(argv) => shared(SourceProvider::Command(argv.clone()), config)?,
    };

    let state = AppState {
        engine,
        gzip_replay: config.gzip_replay,
    };
    Ok((state, pid))
}

fn shared(provider: SourceProvider, config: &ServeConfig) -> Result<(Engine, Option<u32>)> {
    let opened = provider.open()?;
    let capture = if config.persistent {
        CaptureBuffer::persistent(opened.reader)
    } else {
        CaptureBuffer::passthrough(opened.reader)
    };
    let tee = config
        .tee
        .then(|| Box::new(tokio::io::stdout()) as TeeSink);

    let broadcaster = Broadcaster::new(capture, tee);
    Ok((Engine::Shared(Arc::new(broadcaster)), opened.pid))
}

pub fn router(state: AppState, websocket: bool) -> Router {
    let app = if websocket {
        Router::new()
            .route("/", get(ws::page).head(http::reject).fallback(http::reject))
            .route("/ws/", get(ws::upgrade))
    } else {
        Router::new().route("/", get(http::stream).head(http::reject).fallback(http::reject))
    };
    app.with_state(state)
}

// ── Lifecycle ───────────────────────────────────────────────────────

pub async fn run(config: ServeConfig) -> anyhow::Result<()> {
    let (state, source_pid) = build_state(&config).context("failed to open source")?;
    let app = router(state, config.websocket);

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.addr))?;
    let local = listener.local_addr()?;

    info!(
        addr = %local,
        relay = ?config.relay,
        persistent = config.persistent,
        tee = config.tee,
        websocket = config.websocket,
        "listening"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let served = serve_until(listener, app, shutdown, config.grace_period).await;

    if let Some(pid) = source_pid {
        source::terminate(pid);
    }
    served
}

/// Serves `app` until `shutdown` is cancelled, then gives in-flight
/// responses `grace` to finish.
pub async fn serve_until(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> anyhow::Result<()> {
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    tokio::select! {
        res = server => res.context("server error")?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(?grace, "grace period elapsed, dropping open connections");
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
