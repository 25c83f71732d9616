//! torrstream - stream a magnet link over HTTP while it downloads
//!
//! # Usage
//!
//! ```bash
//! torrstream stream "magnet:?xt=urn:btih:..."
//! torrstream stream "magnet:?xt=urn:btih:..." --player none --json
//! torrstream files "magnet:?xt=urn:btih:..."
//! ```

mod cli;
mod commands;

use std::io::Write;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, ExitCode, Output};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = run_cli(cli).await;
    let _ = std::io::stdout().flush();
    // Exit without dropping the runtime, which would join an abandoned prompt thread
    std::process::exit(i32::from(code));
}

/// Log to stderr; `RUST_LOG` wins over `-v`
fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("torrstream={0},librqbit={0}", cli.log_level())));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Run CLI command and return exit code
async fn run_cli(cli: Cli) -> ExitCode {
    let output = Output::new(&cli);
    let config = cli.config.as_deref();

    match cli.command {
        Command::Stream(cmd) => commands::stream_cmd(cmd, config, &output).await,
        Command::Files(cmd) => commands::files_cmd(cmd, config, &output).await,
        Command::Config(cmd) => commands::config_cmd(cmd, config, &output).await,
    }
}
