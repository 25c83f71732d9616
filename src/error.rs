//! Error types for the streaming coordinator
//!
//! Construction-time failures are returned to the caller. Failures inside
//! background tasks are logged and drive teardown instead.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::SessionState;

/// Errors produced by the streaming coordinator
#[derive(Debug, Error)]
pub enum StreamError {
    /// Every port from the starting port up to 65535 is taken
    #[error("no free listen port at or above {0}")]
    NoFreePort(u16),

    #[error("invalid proxy URL '{url}': {reason}")]
    InvalidProxy { url: String, reason: String },

    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The swarm engine refused an operation
    #[error("torrent engine error: {0}")]
    Engine(String),

    #[error("no torrent metadata after {0:?}")]
    MetadataTimeout(Duration),

    #[error("no media file larger than {threshold} bytes in torrent")]
    NoMediaFile { threshold: u64 },

    #[error("file selection cancelled")]
    SelectionCancelled,

    #[error("download stalled: no progress for {0:?}")]
    Stalled(Duration),

    #[error("cannot {op} while session is {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    /// Data directory could not be deleted within the retry budget
    #[error("failed to remove {} after {attempts} attempts: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Configuration errors are fatal to session construction and never retried
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            StreamError::NoFreePort(_)
                | StreamError::InvalidProxy { .. }
                | StreamError::InvalidMagnet(_)
                | StreamError::InvalidConfig(_)
        )
    }

    pub(crate) fn engine(err: impl std::fmt::Display) -> Self {
        StreamError::Engine(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
