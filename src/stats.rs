//! Per-worker hashrate tracking with an N-sample moving average, plus the
//! shared formatting helpers for log output.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

struct WorkerStats {
    /// Rate of the most recent batch, hashes per second.
    current: f64,
    /// Recent batch rates, newest last, capped at the configured window.
    samples: VecDeque<f64>,
}

pub struct Stats {
    workers: Vec<WorkerStats>,
    window: usize,
    started: DateTime<Utc>,
    /// Smoothed total across workers, updated after each full round.
    pub global_hashrate: u64,
}

impl Stats {
    pub fn new(n_workers: usize, window: usize) -> Self {
        let window = window.max(1);
        Self {
            workers: (0..n_workers)
                .map(|_| WorkerStats {
                    current: 0.0,
                    samples: VecDeque::with_capacity(window),
                })
                .collect(),
            window,
            started: Utc::now(),
            global_hashrate: 0,
        }
    }

    /// Record a finished scan batch and return the corrected instant rate.
    pub fn record(&mut self, worker: usize, hashes_done: u64, elapsed_secs: f64, rate_factor: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return self.workers[worker].current;
        }
        let rate = hashes_done as f64 / elapsed_secs * rate_factor;
        let w = &mut self.workers[worker];
        w.current = rate;
        if w.samples.len() == self.window {
            w.samples.pop_front();
        }
        w.samples.push_back(rate);
        rate
    }

    /// Moving-average speed for one worker; the latest instant rate when no
    /// history exists yet.
    pub fn speed(&self, worker: usize) -> f64 {
        let w = &self.workers[worker];
        if w.samples.is_empty() {
            return w.current;
        }
        w.samples.iter().sum::<f64>() / w.samples.len() as f64
    }

    /// Latest instant rate, used for scan-budget sizing.
    pub fn current(&self, worker: usize) -> f64 {
        self.workers[worker].current
    }

    pub fn total_speed(&self) -> f64 {
        (0..self.workers.len()).map(|i| self.speed(i)).sum()
    }

    /// Forget stale history on a clean job; the smoothing restarts from the
    /// most recent batches.
    pub fn purge_old(&mut self) {
        for w in &mut self.workers {
            while w.samples.len() > 4 {
                w.samples.pop_front();
            }
        }
    }

    pub fn purge_all(&mut self) {
        for w in &mut self.workers {
            w.samples.clear();
            w.current = 0.0;
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started).num_seconds()
    }
}

/// "123.45 kH/s" style formatting shared by the hashmeter and banners.
pub fn format_hashrate(rate: f64) -> String {
    const UNITS: [&str; 5] = ["H/s", "kH/s", "MH/s", "GH/s", "TH/s"];
    let mut rate = rate;
    let mut unit = 0;
    while rate >= 1000.0 && unit < UNITS.len() - 1 {
        rate /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", rate, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_over_window() {
        let mut stats = Stats::new(1, 3);
        stats.record(0, 1000, 1.0, 1.0);
        stats.record(0, 2000, 1.0, 1.0);
        stats.record(0, 3000, 1.0, 1.0);
        assert_eq!(stats.speed(0), 2000.0);
        // fourth sample evicts the first
        stats.record(0, 6000, 1.0, 1.0);
        assert!((stats.speed(0) - 11000.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn rate_factor_halves_reported_speed() {
        let mut stats = Stats::new(1, 8);
        let rate = stats.record(0, 10_000, 2.0, 0.5);
        assert_eq!(rate, 2500.0);
    }

    #[test]
    fn zero_elapsed_keeps_previous_rate() {
        let mut stats = Stats::new(1, 8);
        stats.record(0, 1000, 1.0, 1.0);
        let rate = stats.record(0, 999_999, 0.0, 1.0);
        assert_eq!(rate, 1000.0);
    }

    #[test]
    fn total_sums_workers() {
        let mut stats = Stats::new(2, 4);
        stats.record(0, 1000, 1.0, 1.0);
        stats.record(1, 500, 1.0, 1.0);
        assert_eq!(stats.total_speed(), 1500.0);
    }

    #[test]
    fn hashrate_formatting_units() {
        assert_eq!(format_hashrate(950.0), "950.00 H/s");
        assert_eq!(format_hashrate(1_500.0), "1.50 kH/s");
        assert_eq!(format_hashrate(2_000_000.0), "2.00 MH/s");
        assert_eq!(format_hashrate(3.5e9), "3.50 GH/s");
    }
}
