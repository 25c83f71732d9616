//! In-memory swarm engine shared by the integration tests
//!
//! Item bytes live in memory, metadata and progress are driven by the test.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use torrstream::models::{FileEntry, ItemInfo, Magnet};
use torrstream::stream::engine::{ItemStream, ReaderOptions, SwarmEngine, TorrentHandle, TorrentProgress};
use torrstream::stream::teardown::RetryPolicy;
use torrstream::stream::SessionOptions;
use torrstream::{Result, StreamError};

pub const MAGNET: &str =
    "magnet:?xt=urn:btih:c9e15763f722f23e98a29decdfae341b98d53056&dn=Sintel";

pub fn magnet() -> Magnet {
    Magnet::parse(MAGNET).unwrap()
}

/// sample.mkv (1000), movie.mkv (4000), readme.txt (100)
pub fn sample_item() -> ItemInfo {
    ItemInfo::from_files(
        "Sintel",
        [
            ("Sintel/sample.mkv", 1000u64),
            ("Sintel/movie.mkv", 4000),
            ("Sintel/readme.txt", 100),
        ],
    )
}

/// Deterministic content so slices can be compared
pub fn item_bytes(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Bytes of `file` inside `item_bytes(total)`
pub fn file_bytes(file: &FileEntry) -> Vec<u8> {
    item_bytes(file.end())[file.offset as usize..file.end() as usize].to_vec()
}

/// Options for fast, quiet sessions bound to loopback
pub fn test_options(data_dir: &Path) -> SessionOptions {
    SessionOptions {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        host_port: 0,
        data_dir: data_dir.to_path_buf(),
        min_file_size: 500,
        metadata_timeout: Some(Duration::from_secs(5)),
        poll_interval: Duration::from_millis(10),
        progress_interval: Duration::from_millis(20),
        stall_timeout: None,
        selection_wait: Duration::from_secs(5),
        cleanup: RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(1),
        },
        scratch_dir: None,
        progress: false,
        colored: false,
        close_on_complete: false,
        shutdown_grace: Duration::from_millis(500),
    }
}

// =============================================================================
// Fake Torrent
// =============================================================================

pub struct FakeTorrent {
    title: String,
    info: ItemInfo,
    data: Arc<[u8]>,
    metadata_ready: watch::Sender<bool>,
    progress: Mutex<TorrentProgress>,
    pub download_calls: AtomicUsize,
    pub opened: AtomicUsize,
    pub fail_open: AtomicBool,
    pub dropped: AtomicBool,
}

impl FakeTorrent {
    /// Metadata is available immediately
    pub fn new(info: ItemInfo) -> Arc<Self> {
        let torrent = Self::pending(info);
        torrent.release_metadata();
        torrent
    }

    /// Metadata arrives only after [`FakeTorrent::release_metadata`]
    pub fn pending(info: ItemInfo) -> Arc<Self> {
        let data: Arc<[u8]> = item_bytes(info.total_length).into();
        let progress = TorrentProgress {
            item_bytes: 0,
            total: info.total_length,
            file_bytes: vec![0; info.files.len()],
            finished: false,
        };
        Arc::new(Self {
            title: info.name.clone(),
            info,
            data,
            metadata_ready: watch::channel(false).0,
            progress: Mutex::new(progress),
            download_calls: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &ItemInfo {
        &self.info
    }

    pub fn release_metadata(&self) {
        self.metadata_ready.send_replace(true);
    }

    /// Mark the first `bytes` of the item as downloaded
    pub fn set_downloaded(&self, bytes: u64) {
        let bytes = bytes.min(self.info.total_length);
        let mut progress = self.progress.lock().unwrap();
        progress.item_bytes = bytes;
        progress.file_bytes = self
            .info
            .files
            .iter()
            .map(|f| bytes.clamp(f.offset, f.end()) - f.offset)
            .collect();
    }

    pub fn complete(&self) {
        self.set_downloaded(self.info.total_length);
        self.progress.lock().unwrap().finished = true;
    }
}

#[async_trait]
impl TorrentHandle for FakeTorrent {
    fn title(&self) -> &str {
        &self.title
    }

    async fn wait_metadata(&self) -> Result<ItemInfo> {
        let mut rx = self.metadata_ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map_err(|_| StreamError::Engine("metadata channel closed".into()))?;
        Ok(self.info.clone())
    }

    async fn download_all(&self) -> Result<()> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn progress(&self) -> Result<TorrentProgress> {
        Ok(self.progress.lock().unwrap().clone())
    }

    fn open_stream(&self, _options: ReaderOptions) -> Result<Box<dyn ItemStream>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(StreamError::Engine("torrent storage unavailable".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(self.data.clone())))
    }

    async fn drop_torrent(&self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Fake Engine
// =============================================================================

pub struct FakeEngine {
    torrent: Arc<FakeTorrent>,
    pub bound_dirs: Mutex<Vec<PathBuf>>,
    pub closed: AtomicUsize,
}

impl FakeEngine {
    pub fn new(torrent: Arc<FakeTorrent>) -> Arc<Self> {
        Arc::new(Self {
            torrent,
            bound_dirs: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SwarmEngine for FakeEngine {
    fn listen_port(&self) -> u16 {
        36663
    }

    /// Creates the output directory with a partial file, like a real engine would
    async fn bind(
        &self,
        _magnet: &Magnet,
        _title: &str,
        output_dir: &Path,
    ) -> Result<Arc<dyn TorrentHandle>> {
        tokio::fs::create_dir_all(output_dir.join("Sintel")).await?;
        tokio::fs::write(output_dir.join("Sintel").join("movie.mkv"), b"partial").await?;
        self.bound_dirs.lock().unwrap().push(output_dir.to_path_buf());
        Ok(self.torrent.clone())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Output Capture
// =============================================================================

/// Cloneable `Write` sink for progress output
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
