//! Data structures shared across torrstream
//!
//! - **Sources**: the record handed over by source discovery, magnet parsing
//! - **Torrent**: item metadata and the files inside it
//! - **Session**: lifecycle states and progress samples
//! - **Formatting**: human-readable byte counts

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::StreamError;

// =============================================================================
// Source Models
// =============================================================================

/// A torrent found by source discovery
///
/// Only `magnet` and `title` are consumed by the coordinator; the rest is
/// carried for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub magnet: String,
    pub seeders: u32,
    pub leechers: u32,
    pub size: u64,
    pub origin: String,
}

impl Source {
    /// Build a source from a bare magnet link, using its display name as title
    pub fn from_magnet(magnet: &Magnet, title: Option<&str>) -> Self {
        Self {
            title: title
                .map(str::to_string)
                .or_else(|| magnet.display_name.clone())
                .unwrap_or_else(|| magnet.info_hash.clone()),
            magnet: magnet.uri.clone(),
            seeders: 0,
            leechers: 0,
            size: 0,
            origin: "magnet".to_string(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] S:{} L:{} ({})",
            self.title,
            format_bytes(self.size),
            self.seeders,
            self.leechers,
            self.origin
        )
    }
}

/// A validated magnet URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Magnet {
    pub uri: String,
    /// Info hash as given in the `xt` parameter (hex or base32)
    pub info_hash: String,
    /// Optional `dn` display name
    pub display_name: Option<String>,
}

fn is_info_hash(hash: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?:[0-9a-fA-F]{40}|[A-Za-z2-7]{32})$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(hash))
}

impl Magnet {
    /// Parse and validate a magnet URI
    pub fn parse(uri: &str) -> Result<Self, StreamError> {
        let uri = uri.trim();
        if !uri.starts_with("magnet:?") {
            return Err(StreamError::InvalidMagnet(
                "must start with 'magnet:?'".to_string(),
            ));
        }

        let url = Url::parse(uri).map_err(|e| StreamError::InvalidMagnet(e.to_string()))?;

        let mut info_hash = None;
        let mut display_name = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(hash.to_string());
                    }
                }
                "dn" if !value.is_empty() => display_name = Some(value.into_owned()),
                _ => {}
            }
        }

        let info_hash = info_hash
            .ok_or_else(|| StreamError::InvalidMagnet("missing xt=urn:btih: info hash".into()))?;
        if !is_info_hash(&info_hash) {
            return Err(StreamError::InvalidMagnet(format!(
                "malformed info hash '{}'",
                info_hash
            )));
        }

        Ok(Self {
            uri: uri.to_string(),
            info_hash,
            display_name,
        })
    }
}

impl fmt::Display for Magnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({})", name, self.info_hash),
            None => write!(f, "{}", self.info_hash),
        }
    }
}

// =============================================================================
// Torrent Models
// =============================================================================

/// A named byte range `[offset, offset + length)` inside a torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Position in the torrent's file list
    pub index: usize,
    /// Path inside the torrent, `/`-separated
    pub path: String,
    pub offset: u64,
    pub length: u64,
}

impl FileEntry {
    /// Exclusive end offset within the torrent
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Lowercased extension, if any
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// Last path component
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, format_bytes(self.length))
    }
}

/// Torrent metadata, available once the info dictionary has been fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub name: String,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
}

impl ItemInfo {
    /// Lay files out back to back in list order, the way the torrent stores them
    pub fn from_files<I, S>(name: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let mut offset = 0;
        let files: Vec<FileEntry> = files
            .into_iter()
            .enumerate()
            .map(|(index, (path, length))| {
                let entry = FileEntry {
                    index,
                    path: path.into(),
                    offset,
                    length,
                };
                offset += length;
                entry
            })
            .collect();

        Self {
            name: name.into(),
            files,
            total_length: offset,
        }
    }

    /// Find the file containing an item-level offset (zero-length files never match)
    pub fn file_at(&self, offset: u64) -> Option<&FileEntry> {
        self.files
            .iter()
            .find(|f| f.length > 0 && offset >= f.offset && offset < f.end())
    }
}

// =============================================================================
// Session Models
// =============================================================================

/// Lifecycle of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Engine constructed, nothing attached yet
    Created,
    /// Magnet attached, waiting for metadata
    Bound,
    /// Metadata arrived, choosing the media file
    Selecting,
    /// File selected, download and server running
    Downloading,
    /// Whole torrent downloaded
    Completed,
    /// Interrupt received or a background task failed
    Interrupted,
    /// Teardown finished
    Closed,
}

impl SessionState {
    /// States reached once teardown has begun
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Interrupted | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Bound => "bound",
            SessionState::Selecting => "selecting",
            SessionState::Downloading => "downloading",
            SessionState::Completed => "completed",
            SessionState::Interrupted => "interrupted",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Completed byte counts at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub file_bytes: u64,
    pub item_bytes: u64,
    pub at: Instant,
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Format a byte count with SI units ("500 MB", "1.2 GB")
///
/// Values under ten units keep one decimal; larger ones are rounded.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

    if bytes < 10 {
        return format!("{} B", bytes);
    }

    // Round at each unit first so 999.96 MB moves up to 1.0 GB
    let mut value = bytes as f64;
    let mut exp = 0;
    loop {
        let tenths = (value * 10.0).round() / 10.0;
        if tenths < 10.0 {
            return format!("{:.1} {}", tenths, UNITS[exp]);
        }
        let whole = value.round();
        if whole < 1000.0 || exp == UNITS.len() - 1 {
            return format!("{:.0} {}", whole, UNITS[exp]);
        }
        value /= 1000.0;
        exp += 1;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
