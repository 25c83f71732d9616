//! Playback launcher - hands the stream URL to VLC or mpv
//!
//! The player is just another HTTP client of the stream; torrstream only
//! starts it and watches for it to exit.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::info;

/// Supported local players
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerType {
    /// VLC media player (default)
    #[default]
    Vlc,
    /// mpv media player
    Mpv,
}

impl PlayerType {
    /// Get the command name for this player
    pub fn command(&self) -> &'static str {
        match self {
            PlayerType::Vlc => {
                // On macOS, VLC is an app bundle
                #[cfg(target_os = "macos")]
                if std::path::Path::new("/Applications/VLC.app").exists() {
                    return "/Applications/VLC.app/Contents/MacOS/VLC";
                }
                "vlc"
            }
            PlayerType::Mpv => "mpv",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PlayerType::Vlc => "VLC",
            PlayerType::Mpv => "mpv",
        }
    }
}

impl std::fmt::Display for PlayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for PlayerType {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vlc" => Ok(PlayerType::Vlc),
            "mpv" => Ok(PlayerType::Mpv),
            other => Err(PlayerError::Unsupported(other.to_string())),
        }
    }
}

/// Errors from local player operations
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Player '{0}' not found. Install it first.")]
    NotFound(String),
    #[error("Unsupported player '{0}' (expected vlc or mpv)")]
    Unsupported(String),
    #[error("Failed to start player: {0}")]
    StartFailed(#[from] std::io::Error),
    #[error("Subtitle file not found: {0}")]
    SubtitleNotFound(String),
}

/// What to play
#[derive(Debug, Clone, Default)]
pub struct PlayRequest {
    pub url: String,
    pub subtitle: Option<PathBuf>,
    /// Window / media title
    pub title: Option<String>,
}

/// Launches a local player for the stream URL
pub struct LocalPlayer {
    player_type: PlayerType,
    extra_args: Vec<String>,
}

impl LocalPlayer {
    pub fn new(player_type: PlayerType) -> Self {
        Self {
            player_type,
            extra_args: Vec::new(),
        }
    }

    /// Arguments appended after the built-in ones
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn player_type(&self) -> PlayerType {
        self.player_type
    }

    /// Check if the player is available on the system
    pub async fn is_available(&self) -> bool {
        let cmd = self.player_type.command();

        if cmd.starts_with('/') {
            return Path::new(cmd).exists();
        }

        Command::new("which")
            .arg(cmd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Command line arguments for a request, without the program name
    pub fn args(&self, request: &PlayRequest) -> Vec<String> {
        let mut args = vec![request.url.clone()];

        match self.player_type {
            PlayerType::Vlc => {
                if let Some(sub) = &request.subtitle {
                    args.push("--sub-file".to_string());
                    args.push(sub.display().to_string());
                }
                if let Some(title) = &request.title {
                    args.push("--meta-title".to_string());
                    args.push(title.clone());
                }
                args.push("--no-video-title-show".to_string());
            }
            PlayerType::Mpv => {
                if let Some(sub) = &request.subtitle {
                    args.push(format!("--sub-file={}", sub.display()));
                }
                if let Some(title) = &request.title {
                    args.push(format!("--force-media-title={}", title));
                }
                args.push("--force-window=immediate".to_string());
            }
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Spawn the player; the caller owns the child process
    pub fn play(&self, request: &PlayRequest) -> Result<Child, PlayerError> {
        if let Some(sub) = &request.subtitle {
            if !sub.exists() {
                return Err(PlayerError::SubtitleNotFound(sub.display().to_string()));
            }
        }

        let mut cmd = Command::new(self.player_type.command());
        cmd.args(self.args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        info!(player = %self.player_type, url = %request.url, "launching player");
        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlayerError::NotFound(self.player_type.command().to_string())
            } else {
                PlayerError::StartFailed(e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PlayRequest {
        PlayRequest {
            url: "http://localhost:8789".to_string(),
            subtitle: Some(PathBuf::from("/tmp/subs/movie.srt")),
            title: Some("Big Buck Bunny".to_string()),
        }
    }

    #[test]
    fn test_player_type_command() {
        let vlc_cmd = PlayerType::Vlc.command();
        assert!(vlc_cmd == "vlc" || vlc_cmd == "/Applications/VLC.app/Contents/MacOS/VLC");
        assert_eq!(PlayerType::Mpv.command(), "mpv");
    }

    #[test]
    fn test_player_type_parse() {
        assert_eq!("vlc".parse::<PlayerType>().unwrap(), PlayerType::Vlc);
        assert_eq!(" MPV ".parse::<PlayerType>().unwrap(), PlayerType::Mpv);
        assert!(matches!(
            "quicktime".parse::<PlayerType>(),
            Err(PlayerError::Unsupported(_))
        ));
    }

    #[test]
    fn test_vlc_args() {
        let args = LocalPlayer::new(PlayerType::Vlc).args(&request());
        assert_eq!(
            args,
            vec![
                "http://localhost:8789",
                "--sub-file",
                "/tmp/subs/movie.srt",
                "--meta-title",
                "Big Buck Bunny",
                "--no-video-title-show",
            ]
        );
    }

    #[test]
    fn test_mpv_args_with_extra() {
        let player = LocalPlayer::new(PlayerType::Mpv).with_args(vec!["--fs".to_string()]);
        let args = player.args(&request());
        assert_eq!(args[0], "http://localhost:8789");
        assert!(args.contains(&"--sub-file=/tmp/subs/movie.srt".to_string()));
        assert!(args.contains(&"--force-media-title=Big Buck Bunny".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--fs"));
    }

    #[test]
    fn test_missing_subtitle_is_rejected() {
        let player = LocalPlayer::new(PlayerType::Mpv);
        let request = PlayRequest {
            url: "http://localhost:1".to_string(),
            subtitle: Some(PathBuf::from("/definitely/not/here.srt")),
            title: None,
        };
        assert!(matches!(
            player.play(&request),
            Err(PlayerError::SubtitleNotFound(_))
        ));
    }
}
