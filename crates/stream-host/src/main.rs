//! relay-stream-host: serve stdin or a command's output over HTTP.
//!
//! Usage:
//!   relay-stream-host [OPTIONS]                    relay stdin
//!   relay-stream-host [OPTIONS] -- <cmd> [args]    run <cmd> per request
//!   relay-stream-host -m command [OPTIONS] -- <cmd> [args]
//!                                                  run <cmd> once, share it

use std::process;

use clap::Parser;
use relay_stream_host::{logging, server, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format, !cli.no_color);

    let code = match cli.into_config() {
        Ok(config) => match server::run(config).await {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!("{err:#}");
                1
            }
        },
        Err(err) => {
            let err = anyhow::Error::new(err).context("invalid configuration");
            tracing::error!("{err:#}");
            2
        }
    };

    // A pending stdin read parks a blocking thread that runtime shutdown
    // would wait on forever.
    process::exit(code);
}
