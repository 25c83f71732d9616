//! librqbit-backed swarm engine
//!
//! Torrents are added paused so nothing is fetched before a file is chosen.
//! Metadata resolution runs on its own task; `wait_metadata` awaits it.

use std::io::{self, SeekFrom};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use librqbit::api::TorrentIdOrHash;
use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session,
    SessionOptions,
};
use tokio::io::{AsyncRead, AsyncSeek, BufReader, ReadBuf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::models::{ItemInfo, Magnet};

type ManagedTorrentHandle = Arc<ManagedTorrent>;
use crate::stream::engine::{
    ConnectionCaps, EngineConfig, ItemStream, ReaderOptions, SwarmEngine, TorrentHandle,
    TorrentProgress,
};
use crate::stream::reader::resolve_seek;

/// Smallest and largest read buffer handed out by `open_stream`
const MIN_READAHEAD: usize = 64 * 1024;
const MAX_READAHEAD: usize = 16 * 1024 * 1024;

// =============================================================================
// Engine
// =============================================================================

/// Swarm engine running a librqbit session
pub struct RqbitEngine {
    session: Arc<Session>,
    listen_port: u16,
    caps: ConnectionCaps,
    closed: AtomicBool,
}

impl RqbitEngine {
    /// Start a session listening on `config.listen_port`
    ///
    /// librqbit 7 offers no upload switch or peer limits, so peers may be
    /// served while the session runs and the caps are only logged.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let port = config.listen_port;
        // librqbit takes a half-open range, so the top port cannot be expressed
        let end = port.checked_add(1).ok_or(StreamError::NoFreePort(port))?;
        let options = SessionOptions {
            disable_dht_persistence: true,
            listen_port_range: Some(port..end),
            enable_upnp_port_forwarding: false,
            socks_proxy_url: config.proxy.clone(),
            ..Default::default()
        };

        let session = Session::new_with_opts(config.data_dir.clone(), options)
            .await
            .map_err(StreamError::engine)?;

        info!(
            port,
            data_dir = %config.data_dir.display(),
            proxy = config.proxy.is_some(),
            established = config.caps.established_per_torrent,
            half_open = config.caps.half_open_per_torrent,
            total_half_open = config.caps.total_half_open,
            "swarm engine started"
        );
        debug!("connection caps are advisory; librqbit manages peer counts itself");

        Ok(Self {
            session,
            listen_port: port,
            caps: config.caps,
            closed: AtomicBool::new(false),
        })
    }

    pub fn caps(&self) -> ConnectionCaps {
        self.caps
    }
}

#[async_trait]
impl SwarmEngine for RqbitEngine {
    fn listen_port(&self) -> u16 {
        self.listen_port
    }

    async fn bind(
        &self,
        magnet: &Magnet,
        title: &str,
        output_dir: &Path,
    ) -> Result<Arc<dyn TorrentHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Engine("engine is closed".to_string()));
        }

        let options = AddTorrentOptions {
            paused: true,
            overwrite: true,
            output_folder: Some(output_dir.to_string_lossy().into_owned()),
            ..Default::default()
        };

        let session = self.session.clone();
        let uri = magnet.uri.clone();
        let resolve = tokio::spawn(async move {
            session
                .add_torrent(AddTorrent::from_url(uri), Some(options))
                .await
        });

        debug!(info_hash = %magnet.info_hash, dir = %output_dir.display(), "magnet attached");

        Ok(Arc::new(RqbitTorrent {
            title: title.to_string(),
            session: self.session.clone(),
            pending: Mutex::new(Some(resolve)),
            resolved: OnceLock::new(),
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.stop().await;
        info!("swarm engine stopped");
    }
}

// =============================================================================
// Torrent Handle
// =============================================================================

type AddTask = JoinHandle<anyhow::Result<AddTorrentResponse>>;

struct Resolved {
    id: usize,
    handle: ManagedTorrentHandle,
    info: ItemInfo,
}

struct RqbitTorrent {
    title: String,
    session: Arc<Session>,
    pending: Mutex<Option<AddTask>>,
    resolved: OnceLock<Resolved>,
}

impl RqbitTorrent {
    fn resolved(&self) -> Result<&Resolved> {
        self.resolved
            .get()
            .ok_or_else(|| StreamError::Engine("torrent metadata not resolved yet".to_string()))
    }

    fn resolve(&self, response: AddTorrentResponse) -> Result<ItemInfo> {
        let (id, handle) = match response {
            AddTorrentResponse::Added(id, handle) => (id, handle),
            AddTorrentResponse::AlreadyManaged(id, handle) => (id, handle),
            AddTorrentResponse::ListOnly(_) => {
                return Err(StreamError::Engine(
                    "engine returned a list-only response".to_string(),
                ))
            }
        };

        let files = handle.shared().file_infos.iter().map(|f| {
            (
                f.relative_filename.to_string_lossy().replace('\\', "/"),
                f.len,
            )
        });
        let info = ItemInfo::from_files(self.title.clone(), files);

        info!(
            id,
            files = info.files.len(),
            total = info.total_length,
            "torrent metadata resolved"
        );

        let _ = self.resolved.set(Resolved {
            id,
            handle,
            info: info.clone(),
        });
        Ok(info)
    }
}

#[async_trait]
impl TorrentHandle for RqbitTorrent {
    fn title(&self) -> &str {
        &self.title
    }

    async fn wait_metadata(&self) -> Result<ItemInfo> {
        if let Ok(resolved) = self.resolved() {
            return Ok(resolved.info.clone());
        }

        let mut pending = self.pending.lock().await;
        if let Ok(resolved) = self.resolved() {
            return Ok(resolved.info.clone());
        }

        // Awaited by reference so a caller-side timeout leaves the task running
        let task = pending
            .as_mut()
            .ok_or_else(|| StreamError::Engine("torrent was dropped".to_string()))?;
        let outcome = task.await;
        *pending = None;

        match outcome {
            Ok(Ok(response)) => self.resolve(response),
            Ok(Err(e)) => Err(StreamError::engine(e)),
            Err(e) => Err(StreamError::engine(e)),
        }
    }

    async fn download_all(&self) -> Result<()> {
        let resolved = self.resolved()?;
        self.session
            .unpause(&resolved.handle)
            .await
            .map_err(StreamError::engine)
    }

    fn progress(&self) -> Result<TorrentProgress> {
        let stats = self.resolved()?.handle.stats();
        if let Some(error) = stats.error {
            return Err(StreamError::Engine(error));
        }
        Ok(TorrentProgress {
            item_bytes: stats.progress_bytes,
            total: stats.total_bytes,
            file_bytes: stats.file_progress,
            finished: stats.finished,
        })
    }

    fn open_stream(&self, options: ReaderOptions) -> Result<Box<dyn ItemStream>> {
        let resolved = self.resolved()?;
        let capacity = options.readahead.clamp(MIN_READAHEAD, MAX_READAHEAD);
        debug!(
            capacity,
            responsive = options.responsive,
            "opening item stream"
        );
        let stream = TorrentStream::new(resolved.handle.clone(), &resolved.info);
        Ok(Box::new(BufReader::with_capacity(capacity, stream)))
    }

    async fn drop_torrent(&self) {
        if let Some(task) = self.pending.lock().await.take() {
            task.abort();
        }
        if let Ok(resolved) = self.resolved() {
            if let Err(e) = self
                .session
                .delete(TorrentIdOrHash::Id(resolved.id), false)
                .await
            {
                warn!(error = %e, "failed to detach torrent");
            }
        }
    }
}

// =============================================================================
// Item Stream
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Span {
    index: usize,
    offset: u64,
    len: u64,
}

trait FileRead: AsyncRead + AsyncSeek + Send {}

impl<T: AsyncRead + AsyncSeek + Send> FileRead for T {}

struct OpenFile {
    index: usize,
    stream: Pin<Box<dyn FileRead>>,
    pos: u64,
    seeking: bool,
}

/// Item-level reader stitched together from librqbit's per-file streams
///
/// Seeking only records the target; the per-file stream is opened and
/// positioned on the next read.
struct TorrentStream {
    handle: ManagedTorrentHandle,
    spans: Arc<[Span]>,
    total: u64,
    position: u64,
    current: Option<OpenFile>,
}

impl TorrentStream {
    fn new(handle: ManagedTorrentHandle, info: &ItemInfo) -> Self {
        let spans = info
            .files
            .iter()
            .map(|f| Span {
                index: f.index,
                offset: f.offset,
                len: f.length,
            })
            .collect();
        Self {
            handle,
            spans,
            total: info.total_length,
            position: 0,
            current: None,
        }
    }

    fn span_at(&self, offset: u64) -> Option<Span> {
        self.spans
            .iter()
            .copied()
            .find(|s| s.len > 0 && offset >= s.offset && offset < s.offset + s.len)
    }

    fn open(&mut self, index: usize) -> io::Result<()> {
        let stream = self
            .handle
            .clone()
            .stream(index)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.current = Some(OpenFile {
            index,
            stream: Box::pin(stream),
            pos: 0,
            seeking: false,
        });
        Ok(())
    }
}

impl AsyncRead for TorrentStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            let Some(span) = this.span_at(this.position) else {
                return Poll::Ready(Ok(()));
            };
            let local = this.position - span.offset;

            let file = match this.current.as_mut() {
                Some(file) if file.index == span.index => file,
                _ => {
                    this.open(span.index)?;
                    continue;
                }
            };

            if file.pos != local {
                if !file.seeking {
                    file.stream.as_mut().start_seek(SeekFrom::Start(local))?;
                    file.seeking = true;
                }
                let landed = ready!(file.stream.as_mut().poll_complete(cx));
                file.seeking = false;
                match landed.and_then(|pos| seek_landed(pos, local)) {
                    Ok(pos) => file.pos = pos,
                    Err(e) => {
                        this.current = None;
                        return Poll::Ready(Err(e));
                    }
                }
                continue;
            }

            let before = buf.filled().len();
            ready!(file.stream.as_mut().poll_read(cx, buf))?;
            let read = (buf.filled().len() - before) as u64;
            file.pos += read;
            this.position += read;
            return Poll::Ready(Ok(()));
        }
    }
}

impl AsyncSeek for TorrentStream {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        self.position = resolve_seek(self.position, self.total, position)?;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}

/// A per-file seek must land exactly where it was asked to
fn seek_landed(landed: u64, wanted: u64) -> io::Result<u64> {
    if landed == wanted {
        Ok(landed)
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("file stream seek landed at {} instead of {}", landed, wanted),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_landed_on_target() {
        assert_eq!(seek_landed(4096, 4096).unwrap(), 4096);
        assert_eq!(seek_landed(0, 0).unwrap(), 0);
    }

    #[test]
    fn test_seek_landing_elsewhere_is_an_error() {
        let err = seek_landed(1024, 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("landed at 1024 instead of 4096"));
    }
}
