//! Progress reporting: observer trait, emission throttles, console adapter.
//!
//! The core reports progress through the [`ScanObserver`] trait. Emissions
//! are throttled against a monotonic clock: UI callbacks fire at most once
//! per 100 ms and database progress writes at most once per 500 ms. Percent
//! values are derived from work completed, never from wall-clock time.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

use crate::store::session::ScanStage;

/// Minimum interval between UI progress emissions.
pub const UI_EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum interval between database progress writes.
pub const DB_EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Observer for scan progress and stage transitions.
///
/// Implementations must be cheap and thread-safe; callbacks may arrive
/// from the orchestrator thread while workers are running. Exactly one
/// completion signal follows the last progress emission: the orchestrator's
/// return value carries finished/cancelled/failed, never more than one.
pub trait ScanObserver: Send + Sync {
    /// Called with the overall percent (0..=100) and a short message.
    fn on_progress(&self, _percent: u8, _message: &str) {}

    /// Called when the pipeline enters a new stage.
    fn on_stage_change(&self, _stage: ScanStage) {}
}

/// No-op observer for headless runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ScanObserver for NullObserver {}

/// Rate limiter comparing a last-emit timestamp against a monotonic clock.
#[derive(Debug)]
pub struct EmitThrottle {
    last: Mutex<Option<Instant>>,
    interval: Duration,
}

impl EmitThrottle {
    /// Create a throttle with the given minimum interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            interval,
        }
    }

    /// Returns `true` (and arms the throttle) if enough time has passed
    /// since the previous accepted emission, or if `force` is set.
    pub fn ready(&self, force: bool) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        let due = match *last {
            None => true,
            Some(prev) => now.duration_since(prev) >= self.interval,
        };
        if force || due {
            *last = Some(now);
            true
        } else {
            false
        }
    }
}

/// Console progress adapter using indicatif.
///
/// Renders a single percent bar; stage changes update the bar prefix.
pub struct ConsoleProgress {
    bar: Option<ProgressBar>,
}

impl ConsoleProgress {
    /// Create a console reporter.
    ///
    /// # Arguments
    ///
    /// * `quiet` - If true, nothing is displayed.
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        if quiet {
            return Self { bar: None };
        }

        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix:>13} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█>-"),
        );
        Self { bar: Some(bar) }
    }

    /// Finish and clear the bar.
    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl ScanObserver for ConsoleProgress {
    fn on_progress(&self, percent: u8, message: &str) {
        if let Some(bar) = &self.bar {
            bar.set_position(u64::from(percent.min(100)));
            bar.set_message(truncate_message(message, 48));
        }
    }

    fn on_stage_change(&self, stage: ScanStage) {
        if let Some(bar) = &self.bar {
            bar.set_prefix(stage.as_str().to_string());
        }
    }
}

/// Truncate a message for display, keeping the tail (usually the filename).
fn truncate_message(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        return message.to_string();
    }
    let tail: String = message
        .chars()
        .rev()
        .take(max_len.saturating_sub(3))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}
