//! torrstream - stream a magnet link over HTTP while it downloads
//!
//! Attach a magnet, pick the media file, and serve it as a seekable HTTP
//! resource that any player can open before the download has finished.
//!
//! # Modules
//!
//! - `models` - Sources, magnets, torrent files, session states
//! - `config` - Configuration file and environment overrides
//! - `error` - Error taxonomy
//! - `stream` - Engine, selection, HTTP serving, progress and lifecycle

pub mod config;
pub mod error;
pub mod models;
pub mod stream;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, StreamError};
pub use models::{FileEntry, ItemInfo, Magnet, SessionState, Source};
pub use stream::{Session, SessionExit, SessionOptions};
