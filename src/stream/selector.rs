//! Media file selection
//!
//! Files at or below the size threshold (samples, trailers, NFOs) are never
//! candidates. One candidate is picked without asking; several go to a
//! [`FileChooser`].

use inquire::Select;
use tracing::{debug, info};

use crate::error::{Result, StreamError};
use crate::models::{format_bytes, FileEntry};

/// Default candidate threshold (15 MiB)
pub const DEFAULT_MIN_FILE_SIZE: u64 = 15 * 1024 * 1024;

/// Picks one file out of several candidates
pub trait FileChooser: Send + Sync {
    /// Index into `candidates`, or None when the user gave no answer
    fn choose(&self, candidates: &[FileEntry]) -> Option<usize>;
}

/// Files strictly larger than `threshold`, in torrent order
pub fn candidates(files: &[FileEntry], threshold: u64) -> Vec<FileEntry> {
    files
        .iter()
        .filter(|f| f.length > threshold)
        .cloned()
        .collect()
}

/// Choose the file to stream
///
/// The chooser is consulted only when more than one candidate exists.
pub fn select_file(
    files: &[FileEntry],
    threshold: u64,
    chooser: &dyn FileChooser,
) -> Result<FileEntry> {
    let mut candidates = candidates(files, threshold);
    debug!(
        files = files.len(),
        candidates = candidates.len(),
        threshold,
        "selecting media file"
    );

    match candidates.len() {
        0 => Err(StreamError::NoMediaFile { threshold }),
        1 => {
            let file = candidates.remove(0);
            info!(path = %file.path, "auto-selected only candidate");
            Ok(file)
        }
        _ => {
            let index = chooser
                .choose(&candidates)
                .filter(|&i| i < candidates.len())
                .ok_or(StreamError::SelectionCancelled)?;
            let file = candidates.swap_remove(index);
            info!(path = %file.path, "selected file");
            Ok(file)
        }
    }
}

// =============================================================================
// Choosers
// =============================================================================

/// Interactive terminal prompt, first candidate highlighted
#[derive(Debug, Clone, Default)]
pub struct PromptChooser;

impl FileChooser for PromptChooser {
    fn choose(&self, candidates: &[FileEntry]) -> Option<usize> {
        let labels: Vec<String> = candidates
            .iter()
            .map(|f| format!("{} ({})", f.path, format_bytes(f.length)))
            .collect();

        Select::new("Select file to stream:", labels)
            .with_starting_cursor(0)
            .with_help_message("↑↓ to move, enter to select, esc to cancel")
            .raw_prompt()
            .ok()
            .map(|answer| answer.index)
    }
}

/// Non-interactive fallback: the biggest file wins, earliest on ties
#[derive(Debug, Clone, Default)]
pub struct LargestChooser;

impl FileChooser for LargestChooser {
    fn choose(&self, candidates: &[FileEntry]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|(_, f)| f.length)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MIB: u64 = 1024 * 1024;

    /// Records calls and answers with a fixed index
    struct Scripted {
        answer: Option<usize>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answer: Option<usize>) -> Self {
            Self {
                answer,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FileChooser for Scripted {
        fn choose(&self, _candidates: &[FileEntry]) -> Option<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn files(sizes: &[(&str, u64)]) -> Vec<FileEntry> {
        ItemInfo::from_files("item", sizes.iter().map(|(p, s)| (*p, *s))).files
    }

    #[test]
    fn test_single_candidate_auto_selects_without_chooser() {
        let files = files(&[("movie.mkv", 20 * MIB), ("sample.mkv", 5 * MIB)]);
        let chooser = Scripted::new(Some(0));

        let selected = select_file(&files, DEFAULT_MIN_FILE_SIZE, &chooser).unwrap();
        assert_eq!(selected.path, "movie.mkv");
        assert_eq!(chooser.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let files = files(&[("exact.mkv", DEFAULT_MIN_FILE_SIZE), ("over.mkv", DEFAULT_MIN_FILE_SIZE + 1)]);
        let found = candidates(&files, DEFAULT_MIN_FILE_SIZE);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "over.mkv");
    }

    #[test]
    fn test_candidates_are_deterministic() {
        let files = files(&[("a.mkv", 30 * MIB), ("b.nfo", MIB), ("c.mkv", 40 * MIB)]);
        let first = candidates(&files, DEFAULT_MIN_FILE_SIZE);
        let second = candidates(&files, DEFAULT_MIN_FILE_SIZE);
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            vec!["a.mkv", "c.mkv"]
        );
    }

    #[test]
    fn test_multiple_candidates_use_chooser() {
        let files = files(&[("e01.mkv", 300 * MIB), ("e02.mkv", 310 * MIB), ("e03.mkv", 305 * MIB)]);
        let chooser = Scripted::new(Some(2));

        let selected = select_file(&files, DEFAULT_MIN_FILE_SIZE, &chooser).unwrap();
        assert_eq!(selected.path, "e03.mkv");
        assert_eq!(selected.index, 2);
        assert_eq!(selected.offset, 610 * MIB);
        assert_eq!(chooser.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_chooser_without_answer_fails() {
        let files = files(&[("a.mkv", 30 * MIB), ("b.mkv", 30 * MIB)]);
        let err = select_file(&files, DEFAULT_MIN_FILE_SIZE, &Scripted::new(None)).unwrap_err();
        assert!(matches!(err, StreamError::SelectionCancelled));
    }

    #[test]
    fn test_chooser_out_of_range_fails() {
        let files = files(&[("a.mkv", 30 * MIB), ("b.mkv", 30 * MIB)]);
        let err = select_file(&files, DEFAULT_MIN_FILE_SIZE, &Scripted::new(Some(5))).unwrap_err();
        assert!(matches!(err, StreamError::SelectionCancelled));
    }

    #[test]
    fn test_no_candidates_fails() {
        let files = files(&[("sample.mkv", 5 * MIB), ("info.nfo", 1024)]);
        let err = select_file(&files, DEFAULT_MIN_FILE_SIZE, &LargestChooser).unwrap_err();
        assert!(matches!(
            err,
            StreamError::NoMediaFile {
                threshold: DEFAULT_MIN_FILE_SIZE
            }
        ));
    }

    #[test]
    fn test_largest_chooser_prefers_first_on_tie() {
        let files = files(&[("a.mkv", 30 * MIB), ("b.mkv", 50 * MIB), ("c.mkv", 50 * MIB)]);
        assert_eq!(LargestChooser.choose(&files), Some(1));
        assert_eq!(LargestChooser.choose(&[]), None);
    }
}
