//! Download progress reporting
//!
//! A single status line, overwritten in place every tick:
//!
//! ```text
//! Progress: 120 MB / 1.4 GB [ 1.4 GB ] 8.57%  Download Speed: 3.2 MB/s
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::style::Stylize;
use crossterm::terminal::{Clear, ClearType};
use crossterm::QueueableCommand;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{format_bytes, FileEntry, ProgressSample};
use crate::stream::engine::TorrentHandle;
use crate::stream::signal::CompletionSignal;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(1500);

// =============================================================================
// Sampling
// =============================================================================

/// One rendered measurement
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub file_bytes: u64,
    pub file_size: u64,
    pub item_size: u64,
    /// Share of the selected file downloaded, in [0, 100]
    pub percent: f64,
    /// Bytes per second since the previous sample
    pub speed: u64,
}

impl ProgressLine {
    /// Line with color codes for a terminal
    pub fn colored(&self) -> String {
        format!(
            "Progress: {} / {} [ {} ] {}  Download Speed: {}",
            format_bytes(self.file_bytes).green(),
            format_bytes(self.file_size).cyan(),
            format_bytes(self.item_size).dark_grey(),
            format!("{:.2}%", self.percent).yellow(),
            format!("{}/s", format_bytes(self.speed)).magenta(),
        )
    }
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Progress: {} / {} [ {} ] {:.2}%  Download Speed: {}/s",
            format_bytes(self.file_bytes),
            format_bytes(self.file_size),
            format_bytes(self.item_size),
            self.percent,
            format_bytes(self.speed)
        )
    }
}

/// Turns successive samples into percentage and throughput
///
/// Holds the previous sample, so each reporter owns its own.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    previous: Option<ProgressSample>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, sample: ProgressSample, file_size: u64, item_size: u64) -> ProgressLine {
        let speed = match self.previous {
            Some(prev) => {
                let elapsed = sample.at.saturating_duration_since(prev.at).as_secs_f64();
                if elapsed > 0.0 {
                    (sample.file_bytes.saturating_sub(prev.file_bytes) as f64 / elapsed) as u64
                } else {
                    0
                }
            }
            None => 0,
        };
        self.previous = Some(sample);

        let percent = if file_size == 0 {
            100.0
        } else {
            (sample.file_bytes as f64 / file_size as f64 * 100.0).clamp(0.0, 100.0)
        };

        ProgressLine {
            file_bytes: sample.file_bytes.min(file_size),
            file_size,
            item_size,
            percent,
            speed,
        }
    }
}

// =============================================================================
// Reporter Task
// =============================================================================

pub type ProgressSink = Box<dyn Write + Send>;

/// Periodically prints the status line until stopped or the download completes
pub struct ProgressReporter {
    torrent: Arc<dyn TorrentHandle>,
    file: FileEntry,
    item_size: u64,
    completion: CompletionSignal,
    interval: Duration,
    colored: bool,
    out: ProgressSink,
    /// A status line is on screen without its newline
    line_open: bool,
}

impl ProgressReporter {
    pub fn new(
        torrent: Arc<dyn TorrentHandle>,
        file: FileEntry,
        item_size: u64,
        completion: CompletionSignal,
    ) -> Self {
        Self {
            torrent,
            file,
            item_size,
            completion,
            interval: DEFAULT_PROGRESS_INTERVAL,
            colored: true,
            out: Box::new(std::io::stdout()),
            line_open: false,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_output(mut self, out: ProgressSink, colored: bool) -> Self {
        self.out = out;
        self.colored = colored;
        self
    }

    /// Run on a background task until `stop` is cancelled or the download completes
    pub fn spawn(self, stop: CancellationToken) -> ReporterHandle {
        let enabled = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(self.run(enabled.clone(), stop.clone()));
        ReporterHandle {
            enabled,
            stop,
            task: Some(task),
        }
    }

    async fn run(mut self, enabled: Arc<AtomicBool>, stop: CancellationToken) {
        let mut tracker = ProgressTracker::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let completion = self.completion.clone();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = completion.closed() => {
                    if enabled.load(Ordering::SeqCst) {
                        self.report(&mut tracker, true);
                    }
                    break;
                }
                _ = ticker.tick() => {
                    if enabled.load(Ordering::SeqCst) {
                        self.report(&mut tracker, false);
                    }
                }
            }
        }
        if let Err(e) = self.end_line() {
            debug!(error = %e, "progress output closed");
        }
        debug!("progress reporter stopped");
    }

    /// Leave the cursor on a fresh line for whatever prints next
    fn end_line(&mut self) -> std::io::Result<()> {
        if !self.line_open {
            return Ok(());
        }
        self.line_open = false;
        writeln!(self.out)?;
        self.out.flush()
    }

    fn report(&mut self, tracker: &mut ProgressTracker, last: bool) {
        let progress = match self.torrent.progress() {
            Ok(progress) => progress,
            Err(e) => {
                warn!(error = %e, "progress sample failed");
                return;
            }
        };
        let sample = ProgressSample {
            file_bytes: progress.file(self.file.index),
            item_bytes: progress.item_bytes,
            at: Instant::now(),
        };
        let line = tracker.sample(sample, self.file.length, self.item_size);
        if let Err(e) = self.write_line(&line, last) {
            debug!(error = %e, "progress output closed");
        }
    }

    fn write_line(&mut self, line: &ProgressLine, last: bool) -> std::io::Result<()> {
        let text = if self.colored {
            line.colored()
        } else {
            line.to_string()
        };
        write!(self.out, "\r{}", text)?;
        self.out.queue(Clear(ClearType::UntilNewLine))?;
        if last {
            writeln!(self.out)?;
        }
        self.line_open = !last;
        self.out.flush()
    }
}

/// Control over a running reporter
pub struct ReporterHandle {
    enabled: Arc<AtomicBool>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReporterHandle {
    /// Suppress further output without stopping the task
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Disable, stop and wait for the task to exit
    pub async fn stop(&mut self) {
        self.disable();
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(file_bytes: u64, at: Instant) -> ProgressSample {
        ProgressSample {
            file_bytes,
            item_bytes: file_bytes,
            at,
        }
    }

    #[test]
    fn test_speed_from_consecutive_samples() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new();

        let first = tracker.sample(sample(0, start), 1_000_000_000, 1_000_000_000);
        assert_eq!(first.speed, 0);
        assert_eq!(first.percent, 0.0);

        let second = tracker.sample(
            sample(500_000_000, start + Duration::from_millis(1500)),
            1_000_000_000,
            1_000_000_000,
        );
        assert_eq!(second.speed, 333_333_333);
        assert_eq!(format!("{:.2}", second.percent), "50.00");
        assert_eq!(
            second.to_string(),
            "Progress: 500 MB / 1.0 GB [ 1.0 GB ] 50.00%  Download Speed: 333 MB/s"
        );
    }

    #[test]
    fn test_percent_is_monotonic_and_bounded() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new();
        let mut last = -1.0;

        for (i, bytes) in [0u64, 10, 250, 999, 1000, 1200].into_iter().enumerate() {
            let line = tracker.sample(
                sample(bytes, start + Duration::from_secs(i as u64)),
                1000,
                5000,
            );
            assert!(line.percent >= last);
            assert!((0.0..=100.0).contains(&line.percent));
            last = line.percent;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_regressing_bytes_do_not_underflow() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new();
        tracker.sample(sample(800, start), 1000, 1000);
        let line = tracker.sample(sample(700, start + Duration::from_secs(1)), 1000, 1000);
        assert_eq!(line.speed, 0);
    }

    #[test]
    fn test_same_instant_has_zero_speed() {
        let now = Instant::now();
        let mut tracker = ProgressTracker::new();
        tracker.sample(sample(0, now), 10, 10);
        assert_eq!(tracker.sample(sample(5, now), 10, 10).speed, 0);
    }

    #[test]
    fn test_empty_file_reports_complete() {
        let mut tracker = ProgressTracker::new();
        let line = tracker.sample(sample(0, Instant::now()), 0, 0);
        assert_eq!(line.percent, 100.0);
    }
}
