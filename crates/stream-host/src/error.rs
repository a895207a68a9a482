//! Error types for relaying a stream to clients.
//!
//! Everything here is connection-local except `SourceRead`, which leaves
//! the shared capture unable to ever complete.

use std::io;

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The subprocess could not be started.
    #[error("failed to launch {command:?}: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Reading the underlying source failed mid-drain.
    #[error("failed to read source: {0}")]
    SourceRead(#[source] io::Error),

    /// Writing to a client sink failed (usually a disconnect).
    #[error("failed to write to client: {0}")]
    SinkWrite(#[source] io::Error),

    /// The request was not something the transport serves.
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),
}

impl RelayError {
    pub fn launch(argv: &[String], source: io::Error) -> Self {
        Self::Launch {
            command: argv.join(" "),
            source,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Launch { .. } | Self::SourceRead(_) | Self::SinkWrite(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Launch failures and rejections happen before any body byte is sent,
/// so the response is a bare status.
impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::MethodNotAllowed(_) => tracing::debug!(error = %self, "rejected request"),
            _ => tracing::error!(error = %self, "request failed"),
        }
        status.into_response()
    }
}

/// Startup configuration problems, reported before the listener binds.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mode {0} requires a command after `--`")]
    MissingCommand(&'static str),

    #[error("stdin mode does not take a command (got {0:?}); use --mode command or --mode exec")]
    UnexpectedCommand(String),

    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidAddr { addr: String, reason: String },
}

pub type Result<T> = std::result::Result<T, RelayError>;
