//! pty-proxy
//!
//! Opens a new PTY, prints its slave path and proxies this terminal through
//! it until input ends, the child exits or a termination signal arrives.

use std::process::ExitCode;

use clap::Parser;
use pty_proxy::{App, CliArgs, Config};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Logs go to stderr so they never mix with the proxied output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = CliArgs::parse();

    let config = match Config::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pty-proxy: {}", e);
            return ExitCode::FAILURE;
        },
    };

    tracing::debug!(?config, "starting");

    match App::new(config).run() {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)),
        Err(e) => {
            eprintln!("pty-proxy: {}", e);
            ExitCode::FAILURE
        },
    }
}
