//! Background download loop
//!
//! Starts a full-item download, then polls until every byte is present.
//! Completion closes the session's [`CompletionSignal`] exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::models::FileEntry;
use crate::stream::engine::TorrentHandle;
use crate::stream::signal::CompletionSignal;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    /// All bytes present, completion signalled
    Completed,
    /// Stopped by the session before completion
    Cancelled,
}

pub struct DownloadDriver {
    torrent: Arc<dyn TorrentHandle>,
    file: FileEntry,
    completion: CompletionSignal,
    cancel: CancellationToken,
    poll_interval: Duration,
    /// None polls forever
    stall_timeout: Option<Duration>,
}

impl DownloadDriver {
    pub fn new(
        torrent: Arc<dyn TorrentHandle>,
        file: FileEntry,
        completion: CompletionSignal,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            torrent,
            file,
            completion,
            cancel,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stall_timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Drive the download until completion, cancellation or a stall
    pub async fn run(self) -> Result<DriverOutcome> {
        self.torrent.download_all().await?;
        info!(path = %self.file.path, "download started");

        let mut last_bytes = None;
        let mut last_change = Instant::now();

        loop {
            let progress = self.torrent.progress()?;
            if progress.is_complete() {
                if self.completion.close() {
                    info!(bytes = progress.item_bytes, "download complete");
                }
                return Ok(DriverOutcome::Completed);
            }

            if last_bytes != Some(progress.item_bytes) {
                last_bytes = Some(progress.item_bytes);
                last_change = Instant::now();
            } else if let Some(limit) = self.stall_timeout {
                let idle = last_change.elapsed();
                if idle >= limit {
                    warn!(bytes = progress.item_bytes, idle = ?idle, "download stalled");
                    return Err(StreamError::Stalled(limit));
                }
            }

            debug!(
                item = progress.item_bytes,
                file = progress.file(self.file.index),
                total = progress.total,
                "download poll"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(DriverOutcome::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
