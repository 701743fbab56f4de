pub mod history;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub tool_call_count: u64,
    pub tool_calls_by_name: BTreeMap<String, u64>,
    pub turn_count: u64,
    pub turn_duration_samples: Vec<f64>,
    pub turn_duration_avg_seconds: f64,
    pub turn_duration_max_seconds: f64,
    pub step_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    tool_call_count: u64,
    tool_calls_by_name: BTreeMap<String, u64>,
    turn_count: u64,
    turn_durations: Vec<f64>,
    open_turn: Option<Instant>,
    step_count: u64,
    error_count: u64,
}

/// Operational counters for the agent session. All mutations go through
/// one lock; history writes go through a second one.
pub struct MetricsCollector {
    started: Instant,
    counters: Mutex<Counters>,
    flush_lock: Mutex<()>,
    history_file: Option<PathBuf>,
    history_cap: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
            flush_lock: Mutex::new(()),
            history_file: None,
            history_cap: history::DEFAULT_CAP,
        }
    }

    /// Persist snapshots to `path`, keeping at most `cap` entries.
    pub fn with_history(mut self, path: PathBuf, cap: usize) -> Self {
        self.history_file = Some(path);
        self.history_cap = cap;
        self
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_tool_call(&self, name: &str) {
        let mut c = self.counters();
        c.tool_call_count += 1;
        *c.tool_calls_by_name.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn record_turn_begin(&self) {
        let mut c = self.counters();
        c.open_turn = Some(Instant::now());
        c.turn_count += 1;
    }

    /// Close the open turn and record its duration. No-op without an open turn.
    pub fn record_turn_end(&self) {
        let mut c = self.counters();
        if let Some(begun) = c.open_turn.take() {
            c.turn_durations.push(begun.elapsed().as_secs_f64());
        }
    }

    pub fn record_step(&self) {
        self.counters().step_count += 1;
    }

    pub fn record_error(&self) {
        self.counters().error_count += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters();
        let samples = c.turn_durations.clone();
        let avg = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        };
        let max = samples.iter().copied().fold(0.0, f64::max);

        MetricsSnapshot {
            timestamp: Utc::now(),
            uptime_seconds: round_to(self.started.elapsed().as_secs_f64(), 1),
            tool_call_count: c.tool_call_count,
            tool_calls_by_name: c.tool_calls_by_name.clone(),
            turn_count: c.turn_count,
            turn_duration_samples: samples,
            turn_duration_avg_seconds: round_to(avg, 2),
            turn_duration_max_seconds: round_to(max, 2),
            step_count: c.step_count,
            error_count: c.error_count,
        }
    }

    /// Append the current snapshot to the history file. Without a history
    /// file this does nothing.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.history_file else {
            return Ok(());
        };
        // Held across read-modify-replace so concurrent flushes each land.
        let _guard = self.flush_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = self.snapshot();
        history::append_snapshot(path, &snapshot, self.history_cap)?;
        tracing::debug!(
            "metrics saved: {} tool calls, {} turns, {} errors",
            snapshot.tool_call_count,
            snapshot.turn_count,
            snapshot.error_count
        );
        Ok(())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn turn_end_without_begin_is_noop() {
        let metrics = MetricsCollector::new();
        metrics.record_turn_end();
        let snap = metrics.snapshot();
        assert_eq!(snap.turn_count, 0);
        assert!(snap.turn_duration_samples.is_empty());
    }

    #[test]
    fn turn_durations_pair_begin_and_end() {
        let metrics = MetricsCollector::new();
        metrics.record_turn_begin();
        std::thread::sleep(std::time::Duration::from_millis(20));
        metrics.record_turn_end();
        // A second end closes nothing.
        metrics.record_turn_end();

        let snap = metrics.snapshot();
        assert_eq!(snap.turn_count, 1);
        assert_eq!(snap.turn_duration_samples.len(), 1);
        assert!(snap.turn_duration_samples[0] >= 0.02);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_tool_call("shell");
        metrics.record_tool_call("read_file");
        metrics.record_tool_call("shell");
        metrics.record_step();
        metrics.record_error();
        metrics.record_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.tool_call_count, 3);
        assert_eq!(snap.tool_calls_by_name["shell"], 2);
        assert_eq!(snap.tool_calls_by_name["read_file"], 1);
        assert_eq!(snap.step_count, 1);
        assert_eq!(snap.error_count, 2);
    }

    #[test]
    fn concurrent_tool_calls_are_not_lost() {
        let metrics = Arc::new(MetricsCollector::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        metrics.record_tool_call("shell");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.tool_call_count, 4000);
        assert_eq!(snap.tool_calls_by_name["shell"], 4000);
    }

    #[test]
    fn flush_without_history_file_is_ok() {
        MetricsCollector::new().flush().unwrap();
    }

    #[test]
    fn concurrent_flushes_each_append_an_entry() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("metrics.json");
        let metrics = Arc::new(MetricsCollector::new().with_history(path.clone(), 100));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        metrics.record_turn_begin();
                        metrics.flush().unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let entries = history::read_history(&path);
        assert_eq!(entries.len(), 40);
        assert_eq!(entries.last().unwrap()["turn_count"], 40);
    }
}
