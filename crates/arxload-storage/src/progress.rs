//! Transport-independent download progress accounting.

use std::time::{Duration, Instant};

use tracing::info;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    /// Minimum wall time between two progress lines.
    pub min_interval: Duration,
    /// Percentage step used when the total size is known.
    pub percent_step: f64,
    /// Byte boundary used when the total size is unknown.
    pub unknown_size_step: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            percent_step: 5.0,
            unknown_size_step: 64 * MIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub transferred: u64,
    pub total: Option<u64>,
    pub percent: Option<f64>,
    pub bytes_per_sec: f64,
    pub eta: Option<String>,
}

/// Turns a stream of byte-count callbacks into throttled log lines.
#[derive(Debug)]
pub struct ProgressTracker {
    label: String,
    config: ProgressConfig,
    total: Option<u64>,
    transferred: u64,
    started: Instant,
    last_emit: Instant,
    next_percent: f64,
    next_boundary: u64,
}

impl ProgressTracker {
    pub fn new(label: impl Into<String>, total: Option<u64>, config: ProgressConfig) -> Self {
        Self::starting_at(label, total, config, Instant::now())
    }

    pub fn starting_at(
        label: impl Into<String>,
        total: Option<u64>,
        config: ProgressConfig,
        now: Instant,
    ) -> Self {
        let config = ProgressConfig {
            percent_step: config.percent_step.max(0.1),
            unknown_size_step: config.unknown_size_step.max(1),
            ..config
        };
        Self {
            label: label.into(),
            total: total.filter(|t| *t > 0),
            transferred: 0,
            started: now,
            last_emit: now,
            next_percent: config.percent_step,
            next_boundary: config.unknown_size_step,
            config,
        }
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total.filter(|t| *t > 0);
        self.next_percent = self.config.percent_step;
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn record(&mut self, bytes: u64) -> Option<ProgressSnapshot> {
        self.record_at(bytes, Instant::now())
    }

    /// Account `bytes` and return the snapshot if a progress line was emitted.
    pub fn record_at(&mut self, bytes: u64, now: Instant) -> Option<ProgressSnapshot> {
        self.transferred = self.transferred.saturating_add(bytes);
        if now.saturating_duration_since(self.last_emit) < self.config.min_interval {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.started);
        let bytes_per_sec = self.transferred as f64 / elapsed.as_secs_f64().max(1e-3);

        let snapshot = match self.total {
            Some(total) => {
                let percent = self.transferred as f64 / total as f64 * 100.0;
                if percent < self.next_percent {
                    return None;
                }
                while self.next_percent <= percent {
                    self.next_percent += self.config.percent_step;
                }
                ProgressSnapshot {
                    transferred: self.transferred,
                    total: Some(total),
                    percent: Some(percent),
                    bytes_per_sec,
                    eta: Some(fmt_eta(self.transferred, total, elapsed)),
                }
            }
            None => {
                if self.transferred < self.next_boundary {
                    return None;
                }
                while self.next_boundary <= self.transferred {
                    self.next_boundary += self.config.unknown_size_step;
                }
                ProgressSnapshot {
                    transferred: self.transferred,
                    total: None,
                    percent: None,
                    bytes_per_sec,
                    eta: None,
                }
            }
        };

        self.last_emit = now;
        match (snapshot.percent, snapshot.total, &snapshot.eta) {
            (Some(percent), Some(total), Some(eta)) => info!(
                label = %self.label,
                transferred = snapshot.transferred,
                total,
                "{} downloading {percent:.1}% ({}/{}) at {}/s ETA {eta}",
                self.label,
                fmt_bytes(snapshot.transferred as f64),
                fmt_bytes(total as f64),
                fmt_bytes(bytes_per_sec),
            ),
            _ => info!(
                label = %self.label,
                transferred = snapshot.transferred,
                "{} downloaded {} (size unknown) at {}/s",
                self.label,
                fmt_bytes(snapshot.transferred as f64),
                fmt_bytes(bytes_per_sec),
            ),
        }
        Some(snapshot)
    }

    pub fn finish(&self) -> Duration {
        let took = self.started.elapsed();
        info!(
            label = %self.label,
            bytes = self.transferred,
            "{} download complete in {:.1}s size={}",
            self.label,
            took.as_secs_f64(),
            fmt_bytes(self.transferred as f64)
        );
        took
    }
}

pub fn fmt_bytes(mut n: f64) -> String {
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if n < 1024.0 {
            return format!("{n:.1}{unit}");
        }
        n /= 1024.0;
    }
    format!("{n:.1}PB")
}

pub fn fmt_eta(done: u64, total: u64, elapsed: Duration) -> String {
    if done == 0 || total == 0 {
        return "unknown".to_string();
    }
    let speed = done as f64 / elapsed.as_secs_f64().max(1e-6);
    let remaining = total.saturating_sub(done) as f64;
    let secs = (remaining / speed.max(1e-6)) as u64;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
