//! File-scoped reader over an item-level stream
//!
//! Offsets seen by callers are relative to the selected file. Every seek is
//! forwarded to the item stream as an absolute position shifted by the
//! file's start offset, and reads never cross the file's end.

use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, ReadBuf};

use crate::error::Result;
use crate::models::FileEntry;
use crate::stream::engine::{ItemStream, ReaderOptions, TorrentHandle};

/// Resolve a seek request against the current position and stream length
pub(crate) fn resolve_seek(current: u64, len: u64, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => return Ok(n),
        SeekFrom::Current(delta) => current as i128 + delta as i128,
        SeekFrom::End(delta) => len as i128 + delta as i128,
    };
    u64::try_from(target).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        )
    })
}

/// Reader options for a file: prefetch about 1% of it, prioritize the read position
pub fn reader_options(file: &FileEntry) -> ReaderOptions {
    ReaderOptions {
        readahead: usize::try_from(file.length / 100).unwrap_or(usize::MAX),
        responsive: true,
    }
}

pub struct FileReader {
    inner: Box<dyn ItemStream>,
    file: FileEntry,
    position: u64,
}

impl FileReader {
    /// Open a reader for `file`, positioned at its first byte
    pub async fn open(torrent: &dyn TorrentHandle, file: &FileEntry) -> Result<Self> {
        let inner = torrent.open_stream(reader_options(file))?;
        Ok(Self::from_stream(inner, file.clone()).await?)
    }

    /// Wrap an existing item-level stream
    pub async fn from_stream(mut inner: Box<dyn ItemStream>, file: FileEntry) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(file.offset)).await?;
        Ok(Self {
            inner,
            file,
            position: 0,
        })
    }

    pub fn file(&self) -> &FileEntry {
        &self.file
    }

    pub fn len(&self) -> u64 {
        self.file.length
    }

    pub fn is_empty(&self) -> bool {
        self.file.length == 0
    }

    fn remaining(&self) -> u64 {
        self.file.length.saturating_sub(self.position)
    }
}

impl AsyncRead for FileReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let remaining = self.remaining();
        if remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let read = if (buf.remaining() as u64) <= remaining {
            let before = buf.filled().len();
            ready!(Pin::new(&mut *self.inner).poll_read(cx, buf))?;
            buf.filled().len() - before
        } else {
            // Tail of the file: read into a bounded scratch buffer
            let mut scratch = vec![0u8; remaining as usize];
            let mut limited = ReadBuf::new(&mut scratch);
            ready!(Pin::new(&mut *self.inner).poll_read(cx, &mut limited))?;
            let filled = limited.filled();
            buf.put_slice(filled);
            filled.len()
        };

        self.position += read as u64;
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for FileReader {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let target = resolve_seek(self.position, self.file.length, position)?;
        let absolute = target.checked_add(self.file.offset).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek position overflows")
        })?;
        Pin::new(&mut *self.inner).start_seek(SeekFrom::Start(absolute))
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let absolute = ready!(Pin::new(&mut *self.inner).poll_complete(cx))?;
        self.position = absolute.saturating_sub(self.file.offset);
        Poll::Ready(Ok(self.position))
    }
}
