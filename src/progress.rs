/// Progress Module
///
/// Periodic progress lines while walking the chain, and the number formatting
/// shared with the final statistics. Nothing here feeds back into control flow.
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::pipeline::PipelineStats;

/// Logs a status line every `interval` processed blocks
pub struct ProgressReporter {
    tip_height: u64,
    interval: u64,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(tip_height: u64, interval: u64) -> Self {
        Self { tip_height, interval: interval.max(1), started: Instant::now() }
    }

    /// Called after each processed block
    pub fn observe(&self, height: u64, block_time: i64, stats: &PipelineStats) {
        if stats.blocks == 0 || stats.blocks % self.interval != 0 {
            return;
        }

        let elapsed = self.started.elapsed();
        tracing::info!(
            "Height {}/{} ({:.2}%) | {:.2} blocks/s | {:.0} txs/s | block time {}",
            format_number(height),
            format_number(self.tip_height),
            progress_percent(height, self.tip_height),
            rate(stats.blocks, elapsed),
            rate(stats.transactions, elapsed),
            format_block_time(block_time)
        );
    }
}

/// Share of the chain covered, clamped to 100
pub fn progress_percent(height: u64, tip_height: u64) -> f64 {
    if tip_height == 0 {
        return 100.0;
    }
    (height as f64 / tip_height as f64 * 100.0).min(100.0)
}

/// Per-second rate of `count` over `elapsed`
pub fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        count as f64 / secs
    }
}

pub fn format_block_time(time: i64) -> String {
    match DateTime::<Utc>::from_timestamp(time, 0) {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => time.to_string(),
    }
}

/// Format a number with thousand separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}
