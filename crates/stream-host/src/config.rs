//! Command line and the validated server configuration built from it.

use std::net::SocketAddr;
use std::time::Duration;

use clap::builder::{BoolishValueParser, FalseyValueParser};
use clap::{ArgAction, Parser, ValueEnum};

use crate::error::ConfigError;
use crate::exec::ExecStrategy;
use crate::logging::LogFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Relay the server's standard input.
    Stdin,
    /// Run the command once and relay its output to every client.
    Command,
    /// Run the command afresh for every client.
    Exec,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Command => "command",
            Self::Exec => "exec",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "relay-stream-host")]
#[command(about = "Serve stdin or a command's output to HTTP/WebSocket clients")]
#[command(version)]
pub struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "RELAY_ADDR", default_value = "0.0.0.0:8900", value_name = "ADDR")]
    pub addr: String,

    /// Keep the stream and replay it to clients that connect after it ended
    #[arg(short, long, env = "RELAY_PERSISTENT", value_parser = BoolishValueParser::new())]
    pub persistent: bool,

    /// Do not echo the first drain to stdout
    #[arg(long, env = "RELAY_NO_TEE", value_parser = BoolishValueParser::new())]
    pub no_tee: bool,

    /// Source mode (default: stdin without a command, exec with one)
    #[arg(short, long, env = "RELAY_MODE", value_enum)]
    pub mode: Option<Mode>,

    /// Serve a page at / that follows the stream over a WebSocket at /ws/
    #[arg(short, long, env = "RELAY_WEBSOCKET", value_parser = BoolishValueParser::new())]
    pub websocket: bool,

    /// How exec mode delivers output
    #[arg(long, env = "RELAY_EXEC_STRATEGY", value_enum, default_value = "stream")]
    pub exec_strategy: ExecStrategy,

    /// Gzip HTTP replays for clients that accept it
    #[arg(long, env = "RELAY_GZIP_REPLAY", value_parser = BoolishValueParser::new())]
    pub gzip_replay: bool,

    /// Seconds to let in-flight responses finish after a shutdown signal
    #[arg(long, env = "RELAY_GRACE_PERIOD", default_value = "5", value_name = "SECS")]
    pub grace_period: u64,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, env = "RELAY_LOG_FORMAT", value_enum, default_value = "console")]
    pub log_format: LogFormat,

    /// Do not colorize log output
    #[arg(long, env = "NO_COLOR", value_parser = FalseyValueParser::new())]
    pub no_color: bool,

    /// Command to run (after `--`)
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// What the server relays and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relay {
    Stdin,
    Command(Vec<String>),
    Exec {
        argv: Vec<String>,
        strategy: ExecStrategy,
    },
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub addr: SocketAddr,
    pub relay: Relay,
    pub persistent: bool,
    pub tee: bool,
    pub websocket: bool,
    pub gzip_replay: bool,
    pub grace_period: Duration,
}

impl Cli {
    pub fn mode(&self) -> Mode {
        self.mode.unwrap_or(if self.command.is_empty() {
            Mode::Stdin
        } else {
            Mode::Exec
        })
    }

    pub fn into_config(self) -> Result<ServeConfig, ConfigError> {
        let addr = parse_addr(&self.addr)?;
        let relay = match self.mode() {
            Mode::Stdin if !self.command.is_empty() => {
                return Err(ConfigError::UnexpectedCommand(self.command.join(" ")));
            }
            Mode::Stdin => Relay::Stdin,
            mode if self.command.is_empty() => {
                return Err(ConfigError::MissingCommand(mode.as_str()));
            }
            Mode::Command => Relay::Command(self.command),
            Mode::Exec => Relay::Exec {
                argv: self.command,
                strategy: self.exec_strategy,
            },
        };

        Ok(ServeConfig {
            addr,
            relay,
            persistent: self.persistent,
            tee: !self.no_tee,
            websocket: self.websocket,
            gzip_replay: self.gzip_replay,
            grace_period: Duration::from_secs(self.grace_period),
        })
    }
}

/// Accepts `host:port` or a bare `:port` meaning all interfaces.
fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddr {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}
