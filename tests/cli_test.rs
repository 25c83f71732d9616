//! CLI Binary Tests
//!
//! Runs the built binary for paths that never touch the network:
//! argument validation, exit codes and JSON output.

use std::path::Path;
use std::process::{Command, Output};

fn torrstream(args: &[&str], config_dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_torrstream"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_dir)
        .env("HOME", config_dir)
        .env_remove("TORRSTREAM_PROXY")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run torrstream binary")
}

fn json(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).expect("output is not JSON")
}

// =============================================================================
// Argument Validation
// =============================================================================

#[test]
fn test_missing_subcommand_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let out = torrstream(&[], dir.path());
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_invalid_magnet_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let out = torrstream(&["--json", "stream", "http://example.com/movie.torrent"], dir.path());

    assert_eq!(out.status.code(), Some(2));
    let err = json(&out.stderr);
    assert_eq!(err["exit_code"], 2);
    assert!(err["error"]
        .as_str()
        .unwrap()
        .contains("must start with 'magnet:?'"));
}

#[test]
fn test_magnet_without_info_hash() {
    let dir = tempfile::tempdir().unwrap();
    let out = torrstream(&["--json", "files", "magnet:?dn=Sintel"], dir.path());

    assert_eq!(out.status.code(), Some(2));
    assert!(json(&out.stderr)["error"]
        .as_str()
        .unwrap()
        .contains("info hash"));
}

#[test]
fn test_missing_subtitle_file_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let out = torrstream(
        &[
            "--json",
            "stream",
            "magnet:?xt=urn:btih:c9e15763f722f23e98a29decdfae341b98d53056",
            "--player",
            "none",
            "--subtitle-file",
            "/definitely/not/here.srt",
        ],
        dir.path(),
    );
    assert_eq!(out.status.code(), Some(2));
}

// =============================================================================
// Config Command
// =============================================================================

#[test]
fn test_config_init_writes_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torrstream.toml");
    let path_str = path.to_str().unwrap();

    let out = torrstream(&["--json", "--config", path_str, "config", "--init"], dir.path());
    assert_eq!(out.status.code(), Some(0));
    assert!(path.exists());

    let summary = json(&out.stdout);
    assert_eq!(summary["data"]["exists"], true);
    assert_eq!(summary["data"]["config"]["host_port"], 8789);
    assert_eq!(summary["data"]["config"]["torrent_port"], 36663);
    assert_eq!(summary["data"]["config"]["player"], "vlc");
}

#[test]
fn test_config_reads_file_and_env() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torrstream.toml");
    std::fs::write(&path, "host_port = 9100\nplayer = \"mpv\"\n").unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_torrstream"))
        .args(["--json", "--config", path.to_str().unwrap(), "config"])
        .env("TORRSTREAM_DATA_DIR", "/srv/torrstream")
        .output()
        .unwrap();

    assert_eq!(out.status.code(), Some(0));
    let config = &json(&out.stdout)["data"]["config"];
    assert_eq!(config["host_port"], 9100);
    assert_eq!(config["player"], "mpv");
    assert_eq!(config["data_dir"], "/srv/torrstream");
}

#[test]
fn test_malformed_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torrstream.toml");
    std::fs::write(&path, "host_port = \"not a port\"\n").unwrap();

    let out = torrstream(&["--json", "--config", path.to_str().unwrap(), "config"], dir.path());
    assert_eq!(out.status.code(), Some(2));
}
