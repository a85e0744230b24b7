//! Per-stage throughput bookkeeping.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Formats seconds as `MM:SS`. Minutes are not wrapped at 60.
#[must_use]
pub fn format_mm_ss(seconds: f64) -> String {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let whole = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", whole / 60, whole % 60)
}

/// Formats a per-item average as a rate: `x.xxit/s` at one item per second
/// or faster, `x.xxs/it` otherwise.
#[must_use]
pub fn format_rate(avg_secs: f64) -> String {
    if avg_secs <= 0.0 {
        return "?it/s".to_string();
    }
    let rate = 1.0 / avg_secs;
    if rate >= 1.0 {
        format!("{rate:.2}it/s")
    } else {
        format!("{avg_secs:.2}s/it")
    }
}

#[derive(Debug, Clone, Default)]
struct StageStats {
    processed: u64,
    total_secs: f64,
    window: VecDeque<f64>,
}

/// Point-in-time progress of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    /// Stage position.
    pub stage_index: usize,
    /// Items the stage has finished.
    pub processed: u64,
    /// Expected item count, when known.
    pub total: Option<u64>,
    /// Items finished upstream but not yet by this stage.
    pub waiting: u64,
    /// Cumulative processing time in seconds.
    pub elapsed_secs: f64,
    /// Mean of the recent item durations in seconds.
    pub avg_secs: f64,
    /// Estimated time to finish the remaining items, in seconds.
    pub remaining_secs: f64,
}

impl StageSnapshot {
    /// Rate string derived from the average item time.
    #[must_use]
    pub fn rate(&self) -> String {
        format_rate(self.avg_secs)
    }

    /// `"{elapsed}<{remaining} {rate} waiting:{n}"`.
    #[must_use]
    pub fn postfix(&self) -> String {
        format!(
            "{}<{} {} waiting:{}",
            format_mm_ss(self.elapsed_secs),
            format_mm_ss(self.remaining_secs),
            self.rate(),
            self.waiting
        )
    }
}

/// Tracks processed counts and recent item durations for every stage.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: Option<u64>,
    window: usize,
    stages: Vec<StageStats>,
    completed: u64,
}

impl ProgressTracker {
    /// Creates a tracker for `stage_count` stages.
    #[must_use]
    pub fn new(stage_count: usize, total: Option<u64>, window: usize) -> Self {
        Self {
            total,
            window: window.max(1),
            stages: vec![StageStats::default(); stage_count],
            completed: 0,
        }
    }

    /// Expected item count, when known.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Items that left the last stage.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Records one finished item for a stage and returns its new snapshot.
    pub fn record_stage(&mut self, stage_index: usize, elapsed: Duration) -> Option<StageSnapshot> {
        let window = self.window;
        let stats = self.stages.get_mut(stage_index)?;
        let secs = elapsed.as_secs_f64();
        stats.processed += 1;
        stats.total_secs += secs;
        if stats.window.len() == window {
            stats.window.pop_front();
        }
        stats.window.push_back(secs);
        self.snapshot(stage_index)
    }

    /// Records one item leaving the pipeline. Returns the new count.
    pub fn record_completed(&mut self) -> u64 {
        self.completed += 1;
        self.completed
    }

    /// Returns the current snapshot of a stage.
    #[must_use]
    pub fn snapshot(&self, stage_index: usize) -> Option<StageSnapshot> {
        let stats = self.stages.get(stage_index)?;
        #[allow(clippy::cast_precision_loss)]
        let avg_secs = if stats.window.is_empty() {
            0.0
        } else {
            stats.window.iter().sum::<f64>() / stats.window.len() as f64
        };

        let waiting = if stage_index == 0 {
            self.total.map_or(0, |t| t.saturating_sub(stats.processed))
        } else {
            self.stages[stage_index - 1]
                .processed
                .saturating_sub(stats.processed)
        };

        #[allow(clippy::cast_precision_loss)]
        let remaining_secs = self
            .total
            .map_or(0.0, |t| t.saturating_sub(stats.processed) as f64 * avg_secs);

        Some(StageSnapshot {
            stage_index,
            processed: stats.processed,
            total: self.total,
            waiting,
            elapsed_secs: stats.total_secs,
            avg_secs,
            remaining_secs,
        })
    }

    /// Snapshots of every stage.
    #[must_use]
    pub fn snapshots(&self) -> Vec<StageSnapshot> {
        (0..self.stages.len()).filter_map(|i| self.snapshot(i)).collect()
    }
}
