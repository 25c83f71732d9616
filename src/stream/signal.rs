//! One-shot coordination primitives shared by the session's tasks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::models::FileEntry;

// =============================================================================
// Completion Signal
// =============================================================================

/// Broadcast event that closes exactly once
///
/// Closing again is a no-op. Clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the signal; returns true only for the call that closed it
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has been closed
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

// =============================================================================
// Selection Slot
// =============================================================================

/// Write-once slot holding the selected file
///
/// Readers await [`SelectionSlot::wait`] instead of polling.
#[derive(Debug, Clone)]
pub struct SelectionSlot {
    tx: Arc<watch::Sender<Option<FileEntry>>>,
}

impl Default for SelectionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Store the selection; later calls are ignored and return false
    pub fn set(&self, file: FileEntry) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(file);
            true
        })
    }

    pub fn get(&self) -> Option<FileEntry> {
        self.tx.borrow().clone()
    }

    /// Wait until a file has been selected
    pub async fn wait(&self) -> FileEntry {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(file) = rx.borrow_and_update().clone() {
                return file;
            }
            // The sender lives in self, so the channel cannot close under us
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// =============================================================================
// Process Signals
// =============================================================================

/// Resolves on Ctrl-C, or SIGTERM/SIGHUP/SIGQUIT on unix
pub async fn termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let unix = async {
        use tokio::signal::unix::{signal, SignalKind};

        let kinds = [
            SignalKind::terminate(),
            SignalKind::hangup(),
            SignalKind::quit(),
        ];
        let mut streams = Vec::new();
        for kind in kinds {
            match signal(kind) {
                Ok(stream) => streams.push(stream),
                Err(e) => tracing::warn!(error = %e, "cannot install signal handler"),
            }
        }
        if streams.is_empty() {
            std::future::pending::<()>().await;
        }
        let waits = streams.iter_mut().map(|s| Box::pin(s.recv()));
        futures::future::select_all(waits).await;
    };

    #[cfg(not(unix))]
    let unix = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = unix => {}
    }
    tracing::info!("termination signal received");
}
