//! Streaming infrastructure
//!
//! - Engine: swarm engine traits and the librqbit implementation
//! - Selection: picking the media file out of a torrent
//! - Serving: file-scoped reader and the HTTP endpoint
//! - Lifecycle: download driver, progress line, session and teardown
//! - Player: launching VLC or mpv on the stream URL

pub mod driver;
pub mod engine;
pub mod player;
pub mod port;
pub mod progress;
pub mod reader;
pub mod rqbit;
pub mod selector;
pub mod server;
pub mod session;
pub mod signal;
pub mod teardown;

pub use engine::{SwarmEngine, TorrentHandle, TorrentProgress};
pub use player::{LocalPlayer, PlayRequest, PlayerType};
pub use selector::{FileChooser, LargestChooser, PromptChooser};
pub use session::{Session, SessionExit, SessionOptions};
