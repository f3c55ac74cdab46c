//! Live batch summary.
//!
//! The presenter runs on its own timer, independent of upload events, and
//! only ever reads [`ProgressSnapshot`]s. Frames are produced by the pure
//! [`render`] function and drawn through an `indicatif` progress bar.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::progress::{ProgressSnapshot, ProgressTracker};

/// Roughly nine frames per second.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(111);

const BAR_WIDTH: usize = 50;
const RULE: &str = "--------------------------------------------------";

/// Longest list of errored or cancelled files shown in one frame.
const MAX_LISTED: usize = 20;

pub struct Presenter {
    tracker: Arc<ProgressTracker>,
    interval: Duration,
    title: String,
    bar: ProgressBar,
}

impl Presenter {
    /// Draws to stderr.
    pub fn new(tracker: Arc<ProgressTracker>, interval: Duration) -> Self {
        Self::with_bar(tracker, interval, ProgressBar::new(0))
    }

    /// Renders frames without drawing them.
    pub fn hidden(tracker: Arc<ProgressTracker>, interval: Duration) -> Self {
        Self::with_bar(tracker, interval, ProgressBar::hidden())
    }

    fn with_bar(tracker: Arc<ProgressTracker>, interval: Duration, bar: ProgressBar) -> Self {
        let style = ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self {
            tracker,
            interval,
            title: "Mass Relay".to_string(),
            bar,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    fn draw(&self) -> String {
        let frame = render(&self.tracker.snapshot(), &self.title);
        self.bar.set_message(frame.clone());
        frame
    }

    /// Starts redrawing on a fixed interval until the handle is finished.
    pub fn spawn(self) -> PresenterHandle {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.draw();
                    }
                }
            }
            let last = self.draw();
            self.bar.finish();
            last
        });

        PresenterHandle { stop, handle }
    }
}

pub struct PresenterHandle {
    stop: CancellationToken,
    handle: JoinHandle<String>,
}

impl PresenterHandle {
    /// Draws one final frame, stops the timer and returns that frame.
    pub async fn finish(self) -> String {
        self.stop.cancel();
        self.handle.await.unwrap_or_default()
    }
}

/// Renders one summary frame.
pub fn render(snapshot: &ProgressSnapshot, title: &str) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "| {title}");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(
        out,
        "| Total Files: {} | Completed: {}/{} | Succeeded: {}",
        snapshot.total_files, snapshot.completed, snapshot.total_files, snapshot.succeeded
    );
    let _ = writeln!(out, "|");
    let _ = writeln!(out, "| In Progress:");
    for key in &snapshot.in_progress {
        let _ = writeln!(out, "|   - {}", key.file_name());
    }
    let _ = writeln!(out, "|");
    let _ = writeln!(out, "| Errored:");
    list_keys(&mut out, snapshot.errored.iter().map(ToString::to_string));
    if !snapshot.cancelled.is_empty() {
        let _ = writeln!(out, "|");
        let _ = writeln!(out, "| Cancelled:");
        list_keys(&mut out, snapshot.cancelled.iter().map(ToString::to_string));
    }
    let _ = writeln!(out, "|");
    let _ = writeln!(out, "{RULE}");

    let fraction = snapshot.fraction().clamp(0.0, 1.0);
    let filled = (fraction * BAR_WIDTH as f64) as usize;
    let _ = writeln!(
        out,
        "Progress: [{}{}] {:.2}%",
        "=".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        fraction * 100.0
    );
    let _ = writeln!(
        out,
        "Transferred: {} / {}",
        format_size(snapshot.finished_bytes),
        format_size(snapshot.total_bytes)
    );
    match snapshot.estimated_remaining() {
        Some(eta) if !snapshot.is_done() => {
            let _ = write!(out, "Estimated Time Remaining: {}", HumanDuration(eta));
        }
        _ => {
            let _ = write!(out, "Elapsed: {}", HumanDuration(snapshot.elapsed));
        }
    }

    out
}

fn list_keys(out: &mut String, keys: impl ExactSizeIterator<Item = String>) {
    let total = keys.len();
    // Most recent entries are the most useful during a long run
    for key in keys.skip(total.saturating_sub(MAX_LISTED)) {
        let _ = writeln!(out, "|   - {key}");
    }
    if total > MAX_LISTED {
        let _ = writeln!(out, "|   ... and {} earlier", total - MAX_LISTED);
    }
}

pub fn format_size(size: u64) -> String {
    let mut size = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}
