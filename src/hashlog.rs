//! Submission log: catches duplicate `(job_id, nonce)` submits and records
//! which nonce spans each worker already covered for a job.

use std::collections::{HashMap, VecDeque};

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSpan {
    pub worker: usize,
    pub from: u32,
    pub to: u32,
}

#[derive(Default)]
pub struct HashLog {
    /// (job id, nonce) -> epoch seconds of the submit.
    submits: HashMap<(String, u32), u64>,
    /// job id -> covered nonce spans, per worker.
    scans: HashMap<String, Vec<ScanSpan>>,
    /// Job ids in arrival order; purge keeps the newest two.
    jobs: VecDeque<String>,
}

impl HashLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds-since-epoch of a previous submit of this nonce, if any.
    pub fn already_submitted(&self, job_id: &str, nonce: u32) -> Option<u64> {
        self.submits.get(&(job_id.to_string(), nonce)).copied()
    }

    pub fn remember_submit(&mut self, job_id: &str, nonce: u32, now: u64) {
        self.note_job(job_id);
        self.submits.insert((job_id.to_string(), nonce), now);
    }

    /// Record the `[scanned_from, scanned_to]` interval a worker covered.
    /// Contiguous spans from the same worker are merged in place.
    pub fn remember_scan_range(&mut self, job_id: &str, worker: usize, from: u32, to: u32) {
        self.note_job(job_id);
        let spans = self.scans.entry(job_id.to_string()).or_default();
        if let Some(last) = spans
            .iter_mut()
            .rev()
            .find(|s| s.worker == worker && s.to.wrapping_add(1) == from)
        {
            last.to = to;
            return;
        }
        spans.push(ScanSpan { worker, from, to });
    }

    /// True when some worker already covered this nonce for the job.
    pub fn covered(&self, job_id: &str, nonce: u32) -> bool {
        self.scans
            .get(job_id)
            .map(|spans| spans.iter().any(|s| s.from <= nonce && nonce <= s.to))
            .unwrap_or(false)
    }

    /// First nonce at or above `nonce` no span covers yet, so a worker can
    /// resume behind its own (or another worker's) footprint.
    pub fn next_uncovered(&self, job_id: &str, mut nonce: u32) -> u32 {
        while nonce < u32::MAX && self.covered(job_id, nonce) {
            let span_end = self
                .scans
                .get(job_id)
                .and_then(|spans| {
                    spans
                        .iter()
                        .find(|s| s.from <= nonce && nonce <= s.to)
                        .map(|s| s.to)
                })
                .unwrap_or(nonce);
            nonce = span_end.saturating_add(1);
        }
        nonce
    }

    /// Drop everything older than the two most recent jobs (called on a
    /// clean `mining.notify`).
    pub fn purge_old(&mut self) {
        while self.jobs.len() > 2 {
            if let Some(old) = self.jobs.pop_front() {
                self.submits.retain(|(job, _), _| *job != old);
                self.scans.remove(&old);
            }
        }
    }

    pub fn purge_job(&mut self, job_id: &str) {
        self.submits.retain(|(job, _), _| job != job_id);
        self.scans.remove(job_id);
        self.jobs.retain(|j| j != job_id);
    }

    pub fn purge_all(&mut self) {
        self.submits.clear();
        self.scans.clear();
        self.jobs.clear();
    }

    pub fn dump_job(&self, job_id: &str) {
        if let Some(spans) = self.scans.get(job_id) {
            for s in spans {
                debug!(
                    "job {}: worker {} scanned {:08x}-{:08x}",
                    job_id, s.worker, s.from, s.to
                );
            }
        }
    }

    fn note_job(&mut self, job_id: &str) {
        if !self.jobs.iter().any(|j| j == job_id) {
            self.jobs.push_back(job_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_submit_is_reported_with_age() {
        let mut log = HashLog::new();
        assert_eq!(log.already_submitted("job1", 0x1234), None);
        log.remember_submit("job1", 0x1234, 100);
        assert_eq!(log.already_submitted("job1", 0x1234), Some(100));
        assert_eq!(log.already_submitted("job1", 0x1235), None);
        assert_eq!(log.already_submitted("job2", 0x1234), None);
    }

    #[test]
    fn contiguous_spans_merge_per_worker() {
        let mut log = HashLog::new();
        log.remember_scan_range("job1", 0, 0, 999);
        log.remember_scan_range("job1", 0, 1000, 1999);
        log.remember_scan_range("job1", 1, 5000, 5999);
        assert!(log.covered("job1", 1500));
        assert!(log.covered("job1", 5999));
        assert!(!log.covered("job1", 3000));
        assert_eq!(log.scans.get("job1").unwrap().len(), 2);
    }

    #[test]
    fn purge_old_keeps_two_most_recent_jobs() {
        let mut log = HashLog::new();
        log.remember_submit("a", 1, 10);
        log.remember_submit("b", 2, 20);
        log.remember_submit("c", 3, 30);
        log.purge_old();
        assert_eq!(log.already_submitted("a", 1), None);
        assert_eq!(log.already_submitted("b", 2), Some(20));
        assert_eq!(log.already_submitted("c", 3), Some(30));
    }

    #[test]
    fn next_uncovered_skips_past_spans() {
        let mut log = HashLog::new();
        log.remember_scan_range("job1", 0, 100, 199);
        log.remember_scan_range("job1", 1, 200, 299);
        assert_eq!(log.next_uncovered("job1", 50), 50);
        assert_eq!(log.next_uncovered("job1", 150), 300);
        assert_eq!(log.next_uncovered("job1", 250), 300);
        assert_eq!(log.next_uncovered("job2", 150), 150);
    }

    #[test]
    fn purge_job_clears_both_structures() {
        let mut log = HashLog::new();
        log.remember_submit("a", 1, 10);
        log.remember_scan_range("a", 0, 0, 10);
        log.purge_job("a");
        assert_eq!(log.already_submitted("a", 1), None);
        assert!(!log.covered("a", 5));
    }
}
