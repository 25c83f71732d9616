//! CLI - Command Line Interface for torrstream
//!
//! Every command is scriptable; `--json` (or a non-TTY stdout) switches all
//! output to JSON.
//!
//! # Examples
//!
//! ```bash
//! # Stream a magnet into VLC
//! torrstream stream "magnet:?xt=urn:btih:..."
//!
//! # Serve only, play from another device
//! torrstream stream "magnet:?xt=urn:btih:..." --player none
//!
//! # Inspect the file list
//! torrstream files "magnet:?xt=urn:btih:..." --json
//! ```

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::path::PathBuf;

use torrstream::stream::PlayerType;
use torrstream::StreamError;

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit codes for CLI operations (semantic for scripting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Success = 0,
    /// General error
    Error = 1,
    /// Invalid arguments or configuration
    InvalidArgs = 2,
    /// Swarm engine failure or metadata timeout
    EngineError = 3,
    /// No file above the size threshold
    NoMediaFile = 4,
    /// Player could not be launched
    PlayerFailed = 5,
    /// Download stopped making progress
    Stalled = 6,
    /// Download directory could not be deleted
    CleanupFailed = 7,
    /// Stopped by a signal
    Interrupted = 130,
}

impl ExitCode {
    /// Map a coordinator error to its exit code
    pub fn for_error(err: &StreamError) -> Self {
        match err {
            e if e.is_config() => ExitCode::InvalidArgs,
            StreamError::Engine(_) | StreamError::MetadataTimeout(_) => ExitCode::EngineError,
            StreamError::NoMediaFile { .. } | StreamError::SelectionCancelled => {
                ExitCode::NoMediaFile
            }
            StreamError::Stalled(_) => ExitCode::Stalled,
            StreamError::Cleanup { .. } => ExitCode::CleanupFailed,
            _ => ExitCode::Error,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

// =============================================================================
// Main CLI Structure
// =============================================================================

/// torrstream - stream a magnet link over HTTP while it downloads
#[derive(Parser, Debug)]
#[command(
    name = "torrstream",
    version,
    about = "Stream a magnet link over HTTP while it downloads",
    long_about = "Attaches a magnet link, picks the media file, and serves it as a \
                  seekable HTTP stream that any player can open while the download \
                  continues in the background.",
    after_help = "EXAMPLES:\n\
                  torrstream stream \"magnet:?xt=urn:btih:...\"           Stream into VLC\n\
                  torrstream stream \"magnet:...\" --player none         Serve only\n\
                  torrstream files \"magnet:?xt=urn:btih:...\" --json    List torrent files\n\
                  torrstream config --init                            Write default config"
)]
pub struct Cli {
    /// Output format as JSON (default for non-TTY)
    #[arg(long, short = 'j', global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Check if JSON output should be used
    pub fn should_json(&self) -> bool {
        self.json || !std::io::stdout().is_terminal()
    }

    /// Default tracing filter for the verbosity flag
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream a magnet link over HTTP and open it in a player
    #[command(visible_alias = "s")]
    Stream(StreamCmd),

    /// List the files in a magnet's torrent
    #[command(visible_alias = "ls")]
    Files(FilesCmd),

    /// Show or initialize the configuration
    Config(ConfigCmd),
}

/// Player selection for the stream command
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlayerChoice {
    Vlc,
    Mpv,
    /// Serve only; do not launch a player
    None,
}

impl PlayerChoice {
    pub fn player_type(self) -> Option<PlayerType> {
        match self {
            PlayerChoice::Vlc => Some(PlayerType::Vlc),
            PlayerChoice::Mpv => Some(PlayerType::Mpv),
            PlayerChoice::None => None,
        }
    }
}

// =============================================================================
// Stream Command
// =============================================================================

/// Download a magnet and serve its media file while it downloads
#[derive(Args, Debug)]
pub struct StreamCmd {
    /// Magnet link URL
    #[arg(required = true)]
    pub magnet: String,

    /// Display title (defaults to the magnet's dn parameter)
    #[arg(long, short = 't')]
    pub title: Option<String>,

    /// Player to launch (defaults to the configured player)
    #[arg(long, short = 'p', value_enum)]
    pub player: Option<PlayerChoice>,

    /// Path to a local subtitle file (.srt, .vtt)
    #[arg(long)]
    pub subtitle_file: Option<PathBuf>,

    /// Root directory for downloads
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// HTTP port to serve the stream on
    #[arg(long)]
    pub port: Option<u16>,

    /// First port to try for the torrent listener
    #[arg(long)]
    pub torrent_port: Option<u16>,

    /// Exit as soon as the download completes
    #[arg(long)]
    pub exit_on_complete: bool,

    /// Never prompt; pick the largest candidate file
    #[arg(long)]
    pub no_prompt: bool,
}

// =============================================================================
// Files Command
// =============================================================================

/// Resolve metadata and print the torrent's files
#[derive(Args, Debug)]
pub struct FilesCmd {
    /// Magnet link URL
    #[arg(required = true)]
    pub magnet: String,
}

// =============================================================================
// Config Command
// =============================================================================

/// Print the effective configuration
#[derive(Args, Debug)]
pub struct ConfigCmd {
    /// Write the default config file if none exists
    #[arg(long)]
    pub init: bool,
}

// =============================================================================
// JSON Output Types
// =============================================================================

/// Generic JSON output wrapper with status
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonOutput<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub exit_code: i32,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

impl<T: Serialize> JsonOutput<T> {
    /// Create success output with data
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            exit_code: 0,
        }
    }

    /// Create error output (no data)
    pub fn error_msg(msg: impl Into<String>, code: ExitCode) -> JsonOutput<()> {
        JsonOutput::<()> {
            data: None,
            error: Some(msg.into()),
            exit_code: code.into(),
        }
    }
}

// =============================================================================
// Output Helpers
// =============================================================================

/// Output handler for consistent formatting
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    pub fn new(cli: &Cli) -> Self {
        Self {
            json: cli.should_json(),
            quiet: cli.quiet,
        }
    }

    /// Print success data (JSON mode only; human output is printed by callers)
    pub fn print<T: Serialize>(&self, data: T) -> anyhow::Result<()> {
        if self.json {
            let output = JsonOutput::success(data);
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Ok(())
    }

    /// Print error and return exit code
    pub fn error(&self, msg: impl Into<String>, code: ExitCode) -> ExitCode {
        let msg = msg.into();
        if self.json {
            let output = JsonOutput::<()>::error_msg(&msg, code);
            if let Ok(json) = serde_json::to_string_pretty(&output) {
                eprintln!("{}", json);
            }
        } else if !self.quiet {
            eprintln!("Error: {}", msg);
        }
        code
    }

    /// Print a coordinator error with its mapped exit code
    pub fn stream_error(&self, err: &StreamError) -> ExitCode {
        self.error(err.to_string(), ExitCode::for_error(err))
    }

    /// Print info message (suppressed in quiet and JSON modes)
    pub fn info(&self, msg: impl std::fmt::Display) {
        if !self.quiet && !self.json {
            eprintln!("{}", msg);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
