//! HTTP endpoint serving the selected file with Range support
//!
//! Single route. Each request waits for the file selection, opens a fresh
//! [`FileReader`] and streams the requested window while the download
//! continues underneath.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::models::FileEntry;
use crate::stream::engine::TorrentHandle;
use crate::stream::reader::FileReader;
use crate::stream::signal::SelectionSlot;

/// How long a request waits for file selection before giving up
pub const DEFAULT_SELECTION_WAIT: Duration = Duration::from_secs(60);

/// Shared state for the request handler
#[derive(Clone)]
pub struct StreamState {
    pub torrent: Arc<dyn TorrentHandle>,
    pub selected: SelectionSlot,
    pub selection_wait: Duration,
    /// Cancelled when the session tears down; in-flight bodies end early
    pub cancel: CancellationToken,
}

pub struct StreamServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl StreamServer {
    /// Bind and start serving in the background
    pub async fn bind(addr: SocketAddr, state: StreamState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "stream server failed");
            }
        });

        debug!(%addr, "stream server listening");
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, give open connections `grace` to drain, then abort
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!("stream server did not drain in time, aborting");
            self.task.abort();
        }
        debug!(addr = %self.addr, "stream server stopped");
    }
}

pub fn router(state: StreamState) -> Router {
    Router::new()
        .route("/", get(stream_handler))
        .with_state(Arc::new(state))
}

// =============================================================================
// Handler
// =============================================================================

async fn stream_handler(
    State(state): State<Arc<StreamState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let file = tokio::select! {
        file = state.selected.wait() => file,
        _ = state.cancel.cancelled() => {
            return (StatusCode::SERVICE_UNAVAILABLE, "stream is shutting down").into_response();
        }
        _ = tokio::time::sleep(state.selection_wait) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "no file selected yet").into_response();
        }
    };

    let total = file.length;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let Some((start, end, partial)) = byte_range(range, total) else {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", total))],
            "range not satisfiable",
        )
            .into_response();
    };

    debug!(
        path = %file.path,
        %method,
        start,
        end,
        partial,
        "stream request"
    );

    let response_headers = response_headers(&file, start, end, partial);
    let status = if partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    if method == Method::HEAD {
        return (status, response_headers).into_response();
    }

    let mut reader = match FileReader::open(state.torrent.as_ref(), &file).await {
        Ok(reader) => reader,
        Err(e) => {
            error!(error = %e, "failed to open stream reader");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    if start > 0 {
        if let Err(e) = reader.seek(std::io::SeekFrom::Start(start)).await {
            error!(error = %e, start, "failed to seek stream reader");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }

    let body = ReaderStream::new(reader.take(end - start))
        .take_until(state.cancel.clone().cancelled_owned());

    (status, response_headers, Body::from_stream(body)).into_response()
}

fn response_headers(file: &FileEntry, start: u64, end: u64, partial: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(file)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(end - start));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if partial {
        let content_range = format!("bytes {}-{}/{}", start, end - 1, file.length);
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    headers
}

// =============================================================================
// Range Handling
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a single-range `Range` header
///
/// Supports `bytes=start-end`, `bytes=start-` and `bytes=-suffix_len`.
/// Anything else (including multi-range) yields None and the full body is served.
fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let rest = value.trim().strip_prefix("bytes=")?;
    let (start_str, end_str) = rest.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        if len == 0 {
            return None;
        }
        Some(ParsedRange::Suffix { len })
    } else {
        let start: u64 = start_str.parse().ok()?;
        let end_inclusive = if end_str.is_empty() {
            None
        } else {
            Some(end_str.parse::<u64>().ok()?)
        };
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        })
    }
}

/// Resolve a parsed range to `[start, end)` plus whether the response is partial
///
/// None means the range cannot be satisfied.
fn byte_range(range: Option<ParsedRange>, total: u64) -> Option<(u64, u64, bool)> {
    match range {
        None => Some((0, total, false)),
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        }) => {
            let end = end_inclusive.map_or(total, |e| e.saturating_add(1).min(total));
            (start < total && end > start).then_some((start, end, true))
        }
        Some(ParsedRange::Suffix { len }) => {
            (total > 0).then(|| (total.saturating_sub(len), total, true))
        }
    }
}

/// Content type by file extension
pub fn content_type_for(file: &FileEntry) -> &'static str {
    match file.extension().as_deref() {
        Some("mkv") => "video/x-matroska",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("ts") | Some("m2ts") => "video/mp2t",
        Some("mpg") | Some("mpeg") => "video/mpeg",
        Some("wmv") => "video/x-ms-wmv",
        Some("flv") => "video/x-flv",
        Some("ogv") => "video/ogg",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("m4a") => "audio/mp4",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("srt") => "application/x-subrip",
        Some("vtt") => "text/vtt",
        _ => "application/octet-stream",
    }
}
