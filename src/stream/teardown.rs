//! On-disk cleanup with bounded retries
//!
//! File handles are often still held for a moment after the engine closes,
//! so directory removal sleeps before every attempt.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};

/// Attempt count and fixed delay for retried cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(2500),
        }
    }
}

/// Run `op` up to `policy.attempts` times, sleeping `policy.delay` before each try
///
/// Returns the last error with the number of attempts made.
pub async fn retry_with<F, Fut, T>(policy: RetryPolicy, mut op: F) -> std::result::Result<T, (u32, io::Error)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        tokio::time::sleep(policy.delay).await;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "cleanup attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err((
        attempts,
        last_error.unwrap_or_else(|| io::Error::other("no cleanup attempt ran")),
    ))
}

/// Delete `dir` recursively, retrying per `policy`; a missing directory counts as removed
pub async fn remove_dir_with_retry(dir: &Path, policy: RetryPolicy) -> Result<()> {
    let path = dir.to_path_buf();
    retry_with(policy, |_| remove_dir_all_if_exists(path.clone()))
        .await
        .map_err(|(attempts, source)| StreamError::Cleanup {
            path: dir.to_path_buf(),
            attempts,
            source,
        })?;
    info!(dir = %dir.display(), "removed download directory");
    Ok(())
}

async fn remove_dir_all_if_exists(path: PathBuf) -> io::Result<()> {
    match tokio::fs::remove_dir_all(&path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Delete every file directly inside `dir`; failures are logged, not returned
pub async fn remove_scratch_files(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "cannot list scratch directory");
            }
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "scratch listing interrupted");
                break;
            }
        };
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(file = %entry.path().display(), error = %e, "failed to remove scratch file"),
        }
    }
    debug!(dir = %dir.display(), removed, "scratch files removed");
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_fourth_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with(quick(5), move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
                } else {
                    Ok("removed")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "removed");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_attempts() {
        let result: std::result::Result<(), _> = retry_with(quick(3), |_| async {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
        })
        .await;

        let (attempts, err) = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sleeps_before_each_attempt() {
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy {
            attempts: 2,
            delay: Duration::from_secs(2),
        };
        let _ = retry_with(policy, |_| async { Err::<(), _>(io::Error::other("busy")) }).await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_remove_dir_with_retry() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("Some Movie");
        std::fs::create_dir_all(dir.join("Sub")).unwrap();
        std::fs::write(dir.join("Sub").join("movie.mkv"), b"data").unwrap();

        remove_dir_with_retry(&dir, quick(5)).await.unwrap();
        assert!(!dir.exists());

        // Already gone is fine
        remove_dir_with_retry(&dir, quick(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_scratch_files_keeps_directories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.srt"), b"1").unwrap();
        std::fs::write(root.path().join("b.srt"), b"2").unwrap();
        std::fs::create_dir(root.path().join("keep")).unwrap();

        assert_eq!(remove_scratch_files(root.path()).await, 2);
        assert!(root.path().join("keep").exists());
        assert_eq!(remove_scratch_files(&root.path().join("missing")).await, 0);
    }
}
