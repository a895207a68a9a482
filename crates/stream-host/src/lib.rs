//! Serve a read-once byte stream to many HTTP/WebSocket clients.
//!
//! The source (stdin, or a command started once) is drained by the first
//! client while being captured; later clients get a byte-identical replay.
//! In exec mode every client instead gets a fresh run of the command.

pub mod broadcast;
pub mod capture;
pub mod config;
pub mod error;
pub mod exec;
pub mod http;
pub mod logging;
pub mod server;
pub mod source;
pub mod ws;

pub use broadcast::{Broadcaster, ServeOutcome};
pub use capture::{CaptureBuffer, CaptureStatus};
pub use config::{Cli, ServeConfig};
pub use error::{ConfigError, RelayError};
pub use exec::{ExecStrategy, Executor};
