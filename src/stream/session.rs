//! Streaming session lifecycle
//!
//! One session per run:
//!
//! ```text
//! Created -> Bound -> Selecting -> Downloading -> (Completed | Interrupted) -> Closed
//! ```
//!
//! [`Session::bind`] attaches the magnet, [`Session::start`] waits for
//! metadata, selects the file and launches the download driver,
//! [`Session::serve`] starts the HTTP endpoint and progress reporter, and
//! [`Session::close`] tears everything down exactly once.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, StreamError};
use crate::models::{FileEntry, ItemInfo, Magnet, SessionState};
use crate::stream::driver::{DownloadDriver, DriverOutcome, DEFAULT_POLL_INTERVAL};
use crate::stream::engine::{SwarmEngine, TorrentHandle};
use crate::stream::port::find_available_port;
use crate::stream::progress::{ProgressReporter, ProgressSink, ReporterHandle, DEFAULT_PROGRESS_INTERVAL};
use crate::stream::rqbit::RqbitEngine;
use crate::stream::selector::{select_file, FileChooser, DEFAULT_MIN_FILE_SIZE};
use crate::stream::server::{StreamServer, StreamState, DEFAULT_SELECTION_WAIT};
use crate::stream::signal::{termination, CompletionSignal, SelectionSlot};
use crate::stream::teardown::{remove_dir_with_retry, remove_scratch_files, RetryPolicy};

// =============================================================================
// Options
// =============================================================================

/// Runtime knobs for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Interface the stream server binds
    pub bind_ip: IpAddr,
    /// 0 picks an ephemeral port
    pub host_port: u16,
    pub data_dir: PathBuf,
    pub min_file_size: u64,
    pub metadata_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub stall_timeout: Option<Duration>,
    pub selection_wait: Duration,
    pub cleanup: RetryPolicy,
    pub scratch_dir: Option<PathBuf>,
    /// Print the progress line
    pub progress: bool,
    /// Use color codes in the progress line
    pub colored: bool,
    /// Treat completion as a reason to tear down
    pub close_on_complete: bool,
    /// How long open HTTP responses get to drain on shutdown
    pub shutdown_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            host_port: crate::config::DEFAULT_HOST_PORT,
            data_dir: std::env::temp_dir().join("torrstream"),
            min_file_size: DEFAULT_MIN_FILE_SIZE,
            metadata_timeout: Some(Duration::from_secs(300)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            stall_timeout: Some(Duration::from_secs(600)),
            selection_wait: DEFAULT_SELECTION_WAIT,
            cleanup: RetryPolicy::default(),
            scratch_dir: None,
            progress: true,
            colored: true,
            close_on_complete: false,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host_port: config.host_port,
            data_dir: config.data_dir.clone(),
            min_file_size: config.min_file_size,
            metadata_timeout: config.metadata_timeout(),
            stall_timeout: config.stall_timeout(),
            scratch_dir: config.subtitles_dir.clone(),
            close_on_complete: config.exit_on_complete,
            ..Self::default()
        }
    }
}

/// Why a session stopped running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "error")]
pub enum SessionExit {
    Completed,
    /// The player reading the stream quit
    PlayerExited,
    Interrupted,
    Failed(String),
}

// =============================================================================
// Session
// =============================================================================

pub struct Session {
    id: Uuid,
    engine: Arc<dyn SwarmEngine>,
    chooser: Arc<dyn FileChooser>,
    options: SessionOptions,
    state: Arc<watch::Sender<SessionState>>,
    exit: Arc<watch::Sender<Option<SessionExit>>>,
    torrent: OnceLock<Arc<dyn TorrentHandle>>,
    item_dir: OnceLock<PathBuf>,
    info: OnceLock<ItemInfo>,
    selected: SelectionSlot,
    completion: CompletionSignal,
    cancel: CancellationToken,
    server: Mutex<Option<StreamServer>>,
    server_addr: OnceLock<SocketAddr>,
    reporter: Mutex<Option<ReporterHandle>>,
    progress_done: AtomicBool,
    progress_sink: std::sync::Mutex<Option<ProgressSink>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: Mutex<bool>,
}

impl Session {
    /// Validate config, allocate a listen port and start the librqbit engine
    ///
    /// `options` usually comes from [`SessionOptions::from_config`].
    pub async fn new(
        config: &Config,
        options: SessionOptions,
        chooser: Arc<dyn FileChooser>,
    ) -> Result<Self> {
        config.validate()?;
        let port = find_available_port(config.torrent_port)?;
        let engine = RqbitEngine::start(config.engine_config(port)).await?;
        Ok(Self::with_engine(Arc::new(engine), chooser, options))
    }

    /// Session over an already running engine
    pub fn with_engine(
        engine: Arc<dyn SwarmEngine>,
        chooser: Arc<dyn FileChooser>,
        options: SessionOptions,
    ) -> Self {
        let id = Uuid::new_v4();
        info!(session = %id, port = engine.listen_port(), "session created");
        Self {
            id,
            engine,
            chooser,
            options,
            state: Arc::new(watch::channel(SessionState::Created).0),
            exit: Arc::new(watch::channel(None).0),
            torrent: OnceLock::new(),
            item_dir: OnceLock::new(),
            info: OnceLock::new(),
            selected: SelectionSlot::new(),
            completion: CompletionSignal::new(),
            cancel: CancellationToken::new(),
            server: Mutex::new(None),
            server_addr: OnceLock::new(),
            reporter: Mutex::new(None),
            progress_done: AtomicBool::new(false),
            progress_sink: std::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }

    /// Send progress lines somewhere other than stdout
    pub fn with_progress_output(self, sink: ProgressSink) -> Self {
        if let Ok(mut slot) = self.progress_sink.lock() {
            *slot = Some(sink);
        }
        self
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn listen_port(&self) -> u16 {
        self.engine.listen_port()
    }

    pub fn info(&self) -> Option<&ItemInfo> {
        self.info.get()
    }

    pub fn selected(&self) -> Option<FileEntry> {
        self.selected.get()
    }

    pub fn item_dir(&self) -> Option<&Path> {
        self.item_dir.get().map(PathBuf::as_path)
    }

    pub fn completion(&self) -> CompletionSignal {
        self.completion.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server_addr.get().copied()
    }

    /// `http://localhost:{port}` once serving
    pub fn url(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| format!("http://localhost:{}", addr.port()))
    }

    /// Stream URL on the machine's LAN address, for other devices
    pub fn lan_url(&self) -> Option<String> {
        let port = self.local_addr()?.port();
        let ip = local_ip_address::local_ip().ok()?;
        Some(format!("http://{}:{}", ip, port))
    }

    fn torrent(&self, op: &'static str) -> Result<Arc<dyn TorrentHandle>> {
        self.torrent.get().cloned().ok_or(StreamError::InvalidState {
            op,
            state: self.state(),
        })
    }

    fn expect_state(&self, op: &'static str, allowed: &[SessionState]) -> Result<SessionState> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(StreamError::InvalidState { op, state })
        }
    }

    fn span(&self) -> tracing::Span {
        info_span!("session", id = %self.id)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Attach a magnet to the engine; metadata is fetched in the background
    pub async fn bind(&self, magnet: &Magnet, title: &str) -> Result<()> {
        self.expect_state("bind", &[SessionState::Created])?;

        let dir = self
            .options
            .data_dir
            .join(item_dir_name(title, &magnet.info_hash));
        let torrent = self
            .engine
            .bind(magnet, title, &dir)
            .instrument(self.span())
            .await?;

        let _ = self.item_dir.set(dir);
        let _ = self.torrent.set(torrent);
        transition(&self.state, SessionState::Bound);
        info!(session = %self.id, %magnet, title, "magnet bound");
        Ok(())
    }

    /// Wait for the torrent's file list without selecting anything
    pub async fn metadata(&self) -> Result<ItemInfo> {
        if let Some(info) = self.info.get() {
            return Ok(info.clone());
        }
        let torrent = self.torrent("wait for metadata")?;

        let wait = torrent.wait_metadata().instrument(self.span());
        let info = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(StreamError::InvalidState { op: "wait for metadata", state: self.state() });
            }
            result = with_timeout(self.options.metadata_timeout, wait) => result?,
        };

        let _ = self.info.set(info.clone());
        Ok(info)
    }

    /// Block until metadata arrives, select the file and start downloading
    pub async fn start(&self) -> Result<FileEntry> {
        self.expect_state("start", &[SessionState::Bound])?;
        let torrent = self.torrent("start")?;

        let info = self.metadata().await?;
        transition(&self.state, SessionState::Selecting);
        info!(session = %self.id, files = info.files.len(), "metadata received");

        let chooser = self.chooser.clone();
        let files = info.files.clone();
        let threshold = self.options.min_file_size;
        let selection =
            tokio::task::spawn_blocking(move || select_file(&files, threshold, chooser.as_ref()));

        // An interrupt abandons an open prompt
        let file = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(StreamError::InvalidState {
                    op: "start",
                    state: self.state(),
                });
            }
            joined = selection => joined.map_err(|_| StreamError::SelectionCancelled)??,
        };

        if self.cancel.is_cancelled() {
            return Err(StreamError::InvalidState {
                op: "start",
                state: self.state(),
            });
        }
        self.selected.set(file.clone());

        // Set before the driver exists; it may report Completed right away
        transition(&self.state, SessionState::Downloading);
        self.spawn_driver(torrent, file.clone()).await;
        info!(session = %self.id, path = %file.path, length = file.length, "streaming file selected");

        self.start_reporter().await;
        Ok(file)
    }

    async fn spawn_driver(&self, torrent: Arc<dyn TorrentHandle>, file: FileEntry) {
        let driver = DownloadDriver::new(
            torrent,
            file,
            self.completion.clone(),
            self.cancel.child_token(),
        )
        .with_poll_interval(self.options.poll_interval)
        .with_stall_timeout(self.options.stall_timeout);

        let state = self.state.clone();
        let exit = self.exit.clone();
        let close_on_complete = self.options.close_on_complete;

        let task = tokio::spawn(
            async move {
                match driver.run().await {
                    Ok(DriverOutcome::Completed) => {
                        transition(&state, SessionState::Completed);
                        if close_on_complete {
                            record_exit(&exit, SessionExit::Completed);
                        }
                    }
                    Ok(DriverOutcome::Cancelled) => debug!("download driver cancelled"),
                    Err(e) => {
                        error!(error = %e, "download failed");
                        transition(&state, SessionState::Interrupted);
                        record_exit(&exit, SessionExit::Failed(e.to_string()));
                    }
                }
            }
            .instrument(self.span()),
        );
        self.tasks.lock().await.push(task);
    }

    /// Start the HTTP endpoint and progress reporting; returns the stream URL
    ///
    /// May be called before [`Session::start`]; requests wait for the selection.
    pub async fn serve(&self) -> Result<String> {
        self.expect_state(
            "serve",
            &[
                SessionState::Bound,
                SessionState::Selecting,
                SessionState::Downloading,
                SessionState::Completed,
            ],
        )?;

        {
            let mut server = self.server.lock().await;
            if server.is_none() {
                let state = StreamState {
                    torrent: self.torrent("serve")?,
                    selected: self.selected.clone(),
                    selection_wait: self.options.selection_wait,
                    cancel: self.cancel.clone(),
                };
                let addr = SocketAddr::new(self.options.bind_ip, self.options.host_port);
                let bound = StreamServer::bind(addr, state).await?;
                let _ = self.server_addr.set(bound.local_addr());
                *server = Some(bound);
            }
        }

        self.start_reporter().await;

        let url = self.url().ok_or(StreamError::InvalidState {
            op: "serve",
            state: self.state(),
        })?;
        info!(session = %self.id, %url, "serving stream");
        Ok(url)
    }

    /// Reporter needs both a selected file and a running server
    async fn start_reporter(&self) {
        if !self.options.progress
            || self.progress_done.load(Ordering::SeqCst)
            || self.server_addr.get().is_none()
        {
            return;
        }
        let (Some(file), Some(torrent), Some(info)) =
            (self.selected.get(), self.torrent.get().cloned(), self.info.get())
        else {
            return;
        };

        let mut reporter = self.reporter.lock().await;
        if reporter.is_some() {
            return;
        }

        let sink = self.progress_sink.lock().ok().and_then(|mut s| s.take());
        let mut builder = ProgressReporter::new(torrent, file, info.total_length, self.completion.clone())
            .with_interval(self.options.progress_interval);
        builder = match sink {
            Some(sink) => builder.with_output(sink, false),
            None => builder.with_output(Box::new(std::io::stdout()), self.options.colored),
        };
        *reporter = Some(builder.spawn(self.cancel.child_token()));
    }

    /// Stop the progress line for good, e.g. before printing a summary
    ///
    /// A partly drawn line is ended with a newline.
    pub async fn disable_progress(&self) {
        self.progress_done.store(true, Ordering::SeqCst);
        if let Some(reporter) = self.reporter.lock().await.as_mut() {
            reporter.stop().await;
        }
    }

    /// Resolves when the session should be torn down
    pub async fn wait(&self) -> SessionExit {
        let mut rx = self.exit.subscribe();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(SessionExit::Interrupted),
            Err(_) => SessionExit::Interrupted,
        };
        exit
    }

    /// Record why the caller is ending the session; the first reason wins
    pub fn finish(&self, reason: SessionExit) -> bool {
        record_exit(&self.exit, reason)
    }

    /// Record an external interrupt and cancel every background task
    pub fn interrupt(&self) {
        interrupt(&self.state, &self.exit, &self.cancel);
    }

    /// Interrupt the session on Ctrl-C or a termination signal
    pub fn spawn_signal_watcher(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let exit = self.exit.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = termination() => interrupt(&state, &exit, &cancel),
                _ = cancel.cancelled() => {}
            }
        })
    }

    /// Tear everything down; later calls return Ok without doing anything
    ///
    /// Order: progress off, tasks cancelled, server stopped, torrent dropped,
    /// engine closed, data directory and scratch files deleted.
    pub async fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.teardown().instrument(self.span()).await
    }

    async fn teardown(&self) -> Result<()> {
        info!(state = %self.state(), "closing session");

        if let Some(mut reporter) = self.reporter.lock().await.take() {
            reporter.stop().await;
        }

        self.cancel.cancel();

        if let Some(server) = self.server.lock().await.take() {
            server.shutdown(self.options.shutdown_grace).await;
        }

        for task in self.tasks.lock().await.drain(..) {
            let grace = self.options.shutdown_grace;
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }

        if let Some(torrent) = self.torrent.get() {
            torrent.drop_torrent().await;
        }
        self.engine.close().await;

        let mut result = Ok(());
        if let Some(dir) = self.item_dir.get() {
            if let Err(e) = remove_dir_with_retry(dir, self.options.cleanup).await {
                error!(error = %e, "failed to delete download directory");
                result = Err(e);
            }
        }
        if let Some(scratch) = &self.options.scratch_dir {
            remove_scratch_files(scratch).await;
        }

        self.state.send_replace(SessionState::Closed);
        info!("session closed");
        result
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Move forward only; terminal states are never left except to Closed,
/// and Completed only moves on to a terminal state
fn transition(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            return false;
        }
        if *current == SessionState::Completed && !next.is_terminal() {
            return false;
        }
        debug!(from = %current, to = %next, "session state");
        *current = next;
        true
    })
}

/// First reason wins
fn record_exit(exit: &watch::Sender<Option<SessionExit>>, reason: SessionExit) -> bool {
    exit.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    })
}

fn interrupt(
    state: &watch::Sender<SessionState>,
    exit: &watch::Sender<Option<SessionExit>>,
    cancel: &CancellationToken,
) {
    transition(state, SessionState::Interrupted);
    record_exit(exit, SessionExit::Interrupted);
    cancel.cancel();
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StreamError::MetadataTimeout(limit))?,
        None => fut.await,
    }
}

/// Directory name for an item: the title with path-hostile characters replaced
fn item_dir_name(title: &str, fallback: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_dir_name() {
        assert_eq!(item_dir_name("Big Buck Bunny", "hash"), "Big Buck Bunny");
        assert_eq!(item_dir_name("AC/DC: Live", "hash"), "AC_DC_ Live");
        assert_eq!(item_dir_name("..", "hash"), "hash");
        assert_eq!(item_dir_name("   ", "hash"), "hash");
    }

    #[test]
    fn test_transition_never_leaves_terminal() {
        let (state, _rx) = watch::channel(SessionState::Downloading);
        assert!(transition(&state, SessionState::Interrupted));
        assert!(!transition(&state, SessionState::Completed));
        assert_eq!(*state.borrow(), SessionState::Interrupted);
    }

    #[test]
    fn test_completed_only_moves_to_terminal() {
        let (state, _rx) = watch::channel(SessionState::Completed);
        assert!(!transition(&state, SessionState::Downloading));
        assert!(!transition(&state, SessionState::Selecting));
        assert_eq!(*state.borrow(), SessionState::Completed);
        assert!(transition(&state, SessionState::Interrupted));
        assert_eq!(*state.borrow(), SessionState::Interrupted);
    }

    #[test]
    fn test_first_exit_reason_wins() {
        let (exit, _rx) = watch::channel(None);
        assert!(record_exit(&exit, SessionExit::Interrupted));
        assert!(!record_exit(&exit, SessionExit::Failed("late".into())));
        assert_eq!(*exit.borrow(), Some(SessionExit::Interrupted));
    }

    #[test]
    fn test_options_from_config() {
        let config = Config {
            host_port: 9999,
            stall_timeout_secs: 0,
            exit_on_complete: true,
            ..Config::default()
        };
        let options = SessionOptions::from_config(&config);
        assert_eq!(options.host_port, 9999);
        assert!(options.stall_timeout.is_none());
        assert!(options.close_on_complete);
        assert_eq!(options.cleanup, RetryPolicy::default());
    }
}
