//! CLI Command Handlers
//!
//! Each handler takes CLI args and Output, drives a [`Session`], and returns
//! an ExitCode.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use torrstream::models::format_bytes;
use torrstream::stream::selector::candidates;
use torrstream::stream::{FileChooser, LargestChooser, LocalPlayer, PlayRequest, PlayerType, PromptChooser};
use torrstream::{Config, FileEntry, ItemInfo, Magnet, Session, SessionExit, SessionOptions, Source, StreamError};

use crate::cli::{ConfigCmd, ExitCode, FilesCmd, Output, StreamCmd};

/// How long the player launch waits for the endpoint to answer
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Shared Helpers
// =============================================================================

/// Load the config from `--config` or the default location
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env();
            Ok(config)
        }
        None => Config::load(),
    }
}

fn parse_magnet(uri: &str, output: &Output) -> Result<Magnet, ExitCode> {
    Magnet::parse(uri).map_err(|e| output.error(e.to_string(), ExitCode::InvalidArgs))
}

/// Session options for this process's output mode
fn session_options(config: &Config, output: &Output) -> SessionOptions {
    SessionOptions {
        progress: !output.json && !output.quiet,
        colored: std::io::stdout().is_terminal(),
        ..SessionOptions::from_config(config)
    }
}

fn chooser(no_prompt: bool, output: &Output) -> Arc<dyn FileChooser> {
    if no_prompt || output.json || !std::io::stdin().is_terminal() {
        Arc::new(LargestChooser)
    } else {
        Arc::new(PromptChooser)
    }
}

/// Close the session; a cleanup failure is reported and always wins the exit code
async fn close_session(session: &Session, code: ExitCode, output: &Output) -> ExitCode {
    let result = session.close().await;
    if let Err(e) = &result {
        if code != ExitCode::Success {
            tracing::error!(error = %e, earlier = code as i32, "teardown failed after an earlier error");
        }
    }
    fold_cleanup(code, result, output)
}

fn fold_cleanup(code: ExitCode, cleanup: Result<(), StreamError>, output: &Output) -> ExitCode {
    match cleanup {
        Ok(()) => code,
        Err(e) => output.stream_error(&e),
    }
}

// =============================================================================
// Stream Command
// =============================================================================

#[derive(Serialize)]
struct StreamSummary {
    session: String,
    title: String,
    file: Option<FileEntry>,
    url: Option<String>,
    lan_url: Option<String>,
    player: Option<String>,
    exit: SessionExit,
}

pub async fn stream_cmd(cmd: StreamCmd, config_path: Option<&Path>, output: &Output) -> ExitCode {
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => return output.error(format!("Failed to load config: {}", e), ExitCode::InvalidArgs),
    };
    if let Some(dir) = cmd.data_dir.clone() {
        config.data_dir = dir;
    }
    if let Some(port) = cmd.port {
        config.host_port = port;
    }
    if let Some(port) = cmd.torrent_port {
        config.torrent_port = port;
    }
    if cmd.exit_on_complete {
        config.exit_on_complete = true;
    }

    let magnet = match parse_magnet(&cmd.magnet, output) {
        Ok(magnet) => magnet,
        Err(code) => return code,
    };
    let source = Source::from_magnet(&magnet, cmd.title.as_deref());

    let player_type = match resolve_player(&cmd, &config) {
        Ok(player) => player,
        Err(msg) => return output.error(msg, ExitCode::InvalidArgs),
    };
    let player = match player_type {
        Some(player_type) => {
            let player = LocalPlayer::new(player_type).with_args(config.player_args.clone());
            if !player.is_available().await {
                return output.error(
                    format!("{} not found. Install it first.", player_type.display_name()),
                    ExitCode::PlayerFailed,
                );
            }
            Some(player)
        }
        None => None,
    };
    if let Some(sub) = &cmd.subtitle_file {
        if !sub.exists() {
            return output.error(
                format!("Subtitle file not found: {}", sub.display()),
                ExitCode::InvalidArgs,
            );
        }
    }

    let options = session_options(&config, output);
    let session = match Session::new(&config, options, chooser(cmd.no_prompt, output)).await {
        Ok(session) => session,
        Err(e) => return output.stream_error(&e),
    };
    let watcher = session.spawn_signal_watcher();

    output.info(format!("Streaming: {}", source.title));
    let request = PlayRequest {
        url: String::new(),
        subtitle: cmd.subtitle_file.clone(),
        title: Some(source.title.clone()),
    };

    let result = run_stream(&session, &magnet, &source, player.as_ref(), request, output).await;
    watcher.abort();
    session.disable_progress().await;

    let code = match &result {
        Ok(exit) => {
            let summary = StreamSummary {
                session: session.id().to_string(),
                title: source.title.clone(),
                file: session.selected(),
                url: session.url(),
                lan_url: session.lan_url(),
                player: player.as_ref().map(|p| p.player_type().to_string()),
                exit: exit.clone(),
            };
            exit_code(exit, &summary, output)
        }
        Err(e) => output.stream_error(e),
    };

    close_session(&session, code, output).await
}

/// Player from `--player`, falling back to the configured one
fn resolve_player(cmd: &StreamCmd, config: &Config) -> Result<Option<PlayerType>, String> {
    if let Some(choice) = cmd.player {
        return Ok(choice.player_type());
    }
    match config.player.trim() {
        "" | "none" => Ok(None),
        name => name.parse().map(Some).map_err(|e| format!("{}", e)),
    }
}

async fn run_stream(
    session: &Session,
    magnet: &Magnet,
    source: &Source,
    player: Option<&LocalPlayer>,
    mut request: PlayRequest,
    output: &Output,
) -> Result<SessionExit, StreamError> {
    session.bind(magnet, &source.title).await?;
    output.info("Waiting for torrent metadata...");

    let file = match session.start().await {
        Ok(file) => file,
        // Interrupted while waiting for metadata
        Err(StreamError::InvalidState { .. }) if session.state().is_terminal() => {
            return Ok(session.wait().await);
        }
        Err(e) => return Err(e),
    };
    output.info(format!("Selected: {}", file));

    let url = session.serve().await?;
    output.info(format!("Stream URL: {}", url));
    if let Some(lan) = session.lan_url() {
        output.info(format!("LAN URL: {}", lan));
    }

    let Some(player) = player else {
        return Ok(session.wait().await);
    };

    if !wait_for_stream(&url, STREAM_READY_TIMEOUT, output).await {
        output.info("Stream not ready yet, but opening player anyway...");
    }

    request.url = url;
    let mut child = match player.play(&request) {
        Ok(child) => child,
        Err(e) => {
            session.finish(SessionExit::Failed(e.to_string()));
            return Ok(session.wait().await);
        }
    };
    output.info(format!("Opening in {}...", player.player_type().display_name()));

    tokio::select! {
        status = child.wait() => {
            tracing::info!(?status, "player exited");
            session.finish(SessionExit::PlayerExited);
        }
        _ = session.wait() => {}
    }
    Ok(session.wait().await)
}

/// Wait for the stream URL to answer a HEAD probe
async fn wait_for_stream(url: &str, timeout: Duration, output: &Output) -> bool {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let start = std::time::Instant::now();
    output.info("Waiting for stream to be ready...");

    while start.elapsed() < timeout {
        match client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                output.info("Stream ready!");
                return true;
            }
            _ => tokio::time::sleep(Duration::from_secs(1)).await,
        }
    }
    false
}

fn exit_code(exit: &SessionExit, summary: &StreamSummary, output: &Output) -> ExitCode {
    match exit {
        SessionExit::Completed | SessionExit::PlayerExited => {
            if let Err(e) = output.print(summary) {
                return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
            }
            output.info("Done.");
            ExitCode::Success
        }
        SessionExit::Interrupted => {
            output.info("Interrupted.");
            ExitCode::Interrupted
        }
        SessionExit::Failed(msg) => output.error(msg.clone(), ExitCode::Error),
    }
}

// =============================================================================
// Files Command
// =============================================================================

#[derive(Serialize)]
struct FileRow {
    #[serde(flatten)]
    file: FileEntry,
    candidate: bool,
}

#[derive(Serialize)]
struct FilesSummary {
    name: String,
    total_length: u64,
    min_file_size: u64,
    files: Vec<FileRow>,
}

pub async fn files_cmd(cmd: FilesCmd, config_path: Option<&Path>, output: &Output) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => return output.error(format!("Failed to load config: {}", e), ExitCode::InvalidArgs),
    };
    let magnet = match parse_magnet(&cmd.magnet, output) {
        Ok(magnet) => magnet,
        Err(code) => return code,
    };

    let options = SessionOptions {
        progress: false,
        ..SessionOptions::from_config(&config)
    };
    let session = match Session::new(&config, options, Arc::new(LargestChooser)).await {
        Ok(session) => session,
        Err(e) => return output.stream_error(&e),
    };
    let watcher = session.spawn_signal_watcher();

    let source = Source::from_magnet(&magnet, None);
    output.info(format!("Resolving metadata for {}...", source.title));

    let result: Result<ItemInfo, StreamError> = async {
        session.bind(&magnet, &source.title).await?;
        session.metadata().await
    }
    .await;
    watcher.abort();

    let code = match result {
        Ok(info) => {
            let eligible = candidates(&info.files, config.min_file_size);
            let summary = FilesSummary {
                name: info.name.clone(),
                total_length: info.total_length,
                min_file_size: config.min_file_size,
                files: info
                    .files
                    .iter()
                    .map(|file| FileRow {
                        file: file.clone(),
                        candidate: eligible.iter().any(|c| c.index == file.index),
                    })
                    .collect(),
            };
            print_files(&summary, output)
        }
        Err(_) if session.state().is_terminal() => ExitCode::Interrupted,
        Err(e) => output.stream_error(&e),
    };

    close_session(&session, code, output).await
}

fn print_files(summary: &FilesSummary, output: &Output) -> ExitCode {
    if output.json {
        if let Err(e) = output.print(summary) {
            return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
        }
        return ExitCode::Success;
    }

    println!("{} ({})", summary.name, format_bytes(summary.total_length));
    for row in &summary.files {
        let marker = if row.candidate { "*" } else { " " };
        println!(
            "{} {:>4}  {:>10}  {}",
            marker,
            row.file.index,
            format_bytes(row.file.length),
            row.file.path
        );
    }
    output.info(format!(
        "* = playable candidate (larger than {})",
        format_bytes(summary.min_file_size)
    ));
    ExitCode::Success
}

// =============================================================================
// Config Command
// =============================================================================

#[derive(Serialize)]
struct ConfigSummary {
    path: Option<PathBuf>,
    exists: bool,
    config: Config,
}

pub async fn config_cmd(cmd: ConfigCmd, config_path: Option<&Path>, output: &Output) -> ExitCode {
    let path = config_path.map(Path::to_path_buf).or_else(Config::path);

    if cmd.init {
        match &path {
            Some(path) if path.exists() => {
                output.info(format!("Config already exists: {}", path.display()));
            }
            Some(path) => {
                if let Err(e) = Config::default().save_to(path) {
                    return output.error(format!("Failed to write config: {}", e), ExitCode::Error);
                }
                output.info(format!("Wrote default config: {}", path.display()));
            }
            None => return output.error("Could not determine config path", ExitCode::Error),
        }
    }

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => return output.error(format!("Failed to load config: {}", e), ExitCode::InvalidArgs),
    };
    if let Err(e) = config.validate() {
        output.info(format!("Warning: {}", e));
    }

    let summary = ConfigSummary {
        exists: path.as_ref().is_some_and(|p| p.exists()),
        path,
        config,
    };

    if output.json {
        if let Err(e) = output.print(&summary) {
            return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
        }
        return ExitCode::Success;
    }

    match &summary.path {
        Some(path) if summary.exists => println!("# {}", path.display()),
        Some(path) => println!("# {} (not created; showing defaults)", path.display()),
        None => println!("# no config path on this platform"),
    }
    match toml::to_string_pretty(&summary.config) {
        Ok(text) => {
            print!("{}", text);
            ExitCode::Success
        }
        Err(e) => output.error(format!("Failed to serialize: {}", e), ExitCode::Error),
    }
}
