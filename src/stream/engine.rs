//! Swarm engine abstraction
//!
//! The coordinator only talks to these traits. [`RqbitEngine`] is the real
//! implementation; tests plug in an in-memory one.
//!
//! [`RqbitEngine`]: crate::stream::rqbit::RqbitEngine

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::error::Result;
use crate::models::{ItemInfo, Magnet};

// =============================================================================
// Configuration
// =============================================================================

/// Connection limits requested from config
///
/// Advisory: the librqbit engine logs them but has no way to apply them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCaps {
    /// Established peer connections per torrent
    pub established_per_torrent: usize,
    /// In-progress handshakes per torrent
    pub half_open_per_torrent: usize,
    /// In-progress handshakes across all torrents
    pub total_half_open: usize,
}

/// Everything needed to start an engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub listen_port: u16,
    pub caps: ConnectionCaps,
    /// socks5:// URL, already validated
    pub proxy: Option<String>,
}

/// Tuning for an item-level reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Bytes to prefetch ahead of the read position
    pub readahead: usize,
    /// Prioritize bytes at the read position over sequential download
    pub responsive: bool,
}

// =============================================================================
// Progress
// =============================================================================

/// Snapshot of completed bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorrentProgress {
    /// Completed bytes across the whole item
    pub item_bytes: u64,
    /// Item length
    pub total: u64,
    /// Completed bytes per file, indexed like [`ItemInfo::files`]
    pub file_bytes: Vec<u64>,
    /// Engine reports every piece present
    pub finished: bool,
}

impl TorrentProgress {
    pub fn file(&self, index: usize) -> u64 {
        self.file_bytes.get(index).copied().unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.finished || (self.total > 0 && self.item_bytes >= self.total)
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Seekable byte stream over a whole torrent
pub trait ItemStream: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> ItemStream for T {}

/// Owns the peer-to-peer engine
#[async_trait]
pub trait SwarmEngine: Send + Sync {
    /// Port the engine accepts peers on
    fn listen_port(&self) -> u16;

    /// Attach a magnet; returns immediately, metadata resolves in the background
    async fn bind(
        &self,
        magnet: &Magnet,
        title: &str,
        output_dir: &Path,
    ) -> Result<Arc<dyn TorrentHandle>>;

    /// Release network resources. Safe to call more than once.
    async fn close(&self);
}

/// One torrent attached to an engine
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    fn title(&self) -> &str;

    /// Blocks until the file list is known
    async fn wait_metadata(&self) -> Result<ItemInfo>;

    /// Start downloading every file
    async fn download_all(&self) -> Result<()>;

    fn progress(&self) -> Result<TorrentProgress>;

    /// Fresh item-level reader positioned at offset 0
    fn open_stream(&self, options: ReaderOptions) -> Result<Box<dyn ItemStream>>;

    /// Detach from the engine, leaving files on disk
    async fn drop_torrent(&self);
}
