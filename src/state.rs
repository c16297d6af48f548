//! Process-wide shared state: the current-work slot, worker restart flags,
//! the mutable option set that pool switches swap in and out, and the
//! network info published by `getmininginfo`.
//!
//! Lock order: the work slot before stats; hashlog and the stratum session
//! locks are leaves.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::algo::Algorithm;
use crate::hashlog::HashLog;
use crate::stats::Stats;
use crate::work::Work;

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 1;
pub const EXIT_NET: i32 = 2;
pub const EXIT_TIME_LIMIT: i32 = 3;
pub const EXIT_HARDWARE: i32 = 4;

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// f64 stored as bits so readers never take a lock.
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
}

/// The options a pool switch swaps wholesale (per-pool overrides land
/// here), plus the retry policy shared by every network path.
#[derive(Debug, Clone)]
pub struct Options {
    pub scantime: u64,
    pub max_diff: f64,
    pub max_rate: f64,
    pub max_temp: f64,
    pub time_limit: u64,
    /// User difficulty divisor; the share-result handler shrinks it by
    /// 2/3 on "low difficulty" rejects.
    pub difficulty: f64,
    pub retries: i32,
    pub fail_pause: u64,
    pub timeout: u64,
    pub vote: u16,
    pub trust_pool: bool,
    pub extranonce_subscribe: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scantime: 10,
            max_diff: 0.0,
            max_rate: 0.0,
            max_temp: 0.0,
            time_limit: 0,
            difficulty: 1.0,
            retries: -1,
            fail_pause: 30,
            timeout: 270,
            vote: 0,
            trust_pool: false,
            extranonce_subscribe: true,
        }
    }
}

/// Credentials of the pool currently mined; swapped on failover.
#[derive(Debug, Clone, Default)]
pub struct Creds {
    pub url: String,
    pub short_url: String,
    pub user: String,
    pub pass: String,
}

/// The consensus point between network producers and workers.
pub struct Slot {
    pub work: Work,
    /// Epoch seconds of the last successful publish; 0 forces a refetch.
    pub time: u64,
}

pub struct SharedState {
    pub algo: Algorithm,
    pub n_workers: usize,
    pub benchmark: bool,
    pub quiet: bool,

    slot: Mutex<Slot>,
    restart: Vec<AtomicBool>,
    conditional: Vec<AtomicBool>,

    pub abort: AtomicBool,
    pub cur_pool: AtomicUsize,
    pub opts: RwLock<Options>,
    pub creds: RwLock<Creds>,

    pub want_stratum: AtomicBool,
    pub have_stratum: AtomicBool,
    pub want_longpoll: AtomicBool,
    pub have_longpoll: AtomicBool,
    pub allow_gbt: AtomicBool,
    pub allow_mininginfo: AtomicBool,
    pub check_dups: AtomicBool,
    pub submit_old: AtomicBool,
    pub pool_is_switching: AtomicBool,
    pub stratum_need_reset: AtomicBool,
    pub conditional_pool_rotate: AtomicBool,

    pub firstwork_time: AtomicU64,
    pub app_exit_code: AtomicI32,

    pub net_diff: AtomicF64,
    pub net_hashrate: AtomicU64,
    pub net_blocks: AtomicU64,

    pub hashlog: Mutex<HashLog>,
    pub stats: Mutex<Stats>,
}

impl SharedState {
    pub fn new(algo: Algorithm, n_workers: usize, opts: Options, statsavg: usize) -> Self {
        Self {
            algo,
            n_workers,
            benchmark: false,
            quiet: false,
            slot: Mutex::new(Slot {
                work: Work::default(),
                time: 0,
            }),
            restart: (0..n_workers).map(|_| AtomicBool::new(false)).collect(),
            conditional: (0..n_workers).map(|_| AtomicBool::new(false)).collect(),
            abort: AtomicBool::new(false),
            cur_pool: AtomicUsize::new(0),
            opts: RwLock::new(opts),
            creds: RwLock::new(Creds::default()),
            want_stratum: AtomicBool::new(true),
            have_stratum: AtomicBool::new(false),
            want_longpoll: AtomicBool::new(true),
            have_longpoll: AtomicBool::new(false),
            allow_gbt: AtomicBool::new(true),
            allow_mininginfo: AtomicBool::new(true),
            check_dups: AtomicBool::new(false),
            submit_old: AtomicBool::new(false),
            pool_is_switching: AtomicBool::new(false),
            stratum_need_reset: AtomicBool::new(false),
            conditional_pool_rotate: AtomicBool::new(false),
            firstwork_time: AtomicU64::new(0),
            app_exit_code: AtomicI32::new(EXIT_OK),
            net_diff: AtomicF64::new(0.0),
            net_hashrate: AtomicU64::new(0),
            net_blocks: AtomicU64::new(0),
            hashlog: Mutex::new(HashLog::new()),
            stats: Mutex::new(Stats::new(n_workers, statsavg)),
        }
    }

    pub fn with_benchmark(mut self, benchmark: bool) -> Self {
        self.benchmark = benchmark;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Full access for the scheduler's compare-and-copy critical section.
    pub fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().expect("work slot poisoned")
    }

    /// Producer path: install a new job and stamp the publish time.
    pub fn publish(&self, work: Work) {
        let mut slot = self.lock_slot();
        slot.work = work;
        slot.time = now_secs().max(slot.time);
    }

    /// Copy of the current job together with its publish time; the pool id
    /// rides inside the work record, read under the same lock.
    pub fn snapshot(&self) -> (Work, u64) {
        let slot = self.lock_slot();
        (slot.work.clone(), slot.time)
    }

    pub fn work_time(&self) -> u64 {
        self.lock_slot().time
    }

    /// Force every consumer to refetch: zero time and poison the version
    /// word so prefix comparisons fail.
    pub fn invalidate_work(&self) {
        let mut slot = self.lock_slot();
        slot.time = 0;
        slot.work.data[0] = 0;
    }

    pub fn restart_all(&self) {
        for flag in &self.restart {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn restart_pending(&self, worker: usize) -> bool {
        self.restart[worker].load(Ordering::SeqCst)
    }

    /// Consume the worker's restart flag at the top of its loop.
    pub fn take_restart(&self, worker: usize) -> bool {
        self.restart[worker].swap(false, Ordering::SeqCst)
    }

    /// Direct flag handle, polled by scan kernels mid-batch.
    pub fn restart_flag(&self, worker: usize) -> &AtomicBool {
        &self.restart[worker]
    }

    /// Tracks whether the conditional-mining gate already logged for this
    /// worker, so the wait reason prints once per episode.
    pub fn set_conditional(&self, worker: usize, gated: bool) -> bool {
        self.conditional[worker].swap(gated, Ordering::Relaxed)
    }

    pub fn is_conditional(&self, worker: usize) -> bool {
        self.conditional[worker].load(Ordering::Relaxed)
    }

    pub fn cur_pool(&self) -> usize {
        self.cur_pool.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn request_exit(&self, code: i32) {
        self.app_exit_code.store(code, Ordering::SeqCst);
        self.abort.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SharedState {
        SharedState::new(Algorithm::X11, 2, Options::default(), 30)
    }

    #[test]
    fn publish_updates_time_monotonically() {
        let s = state();
        assert_eq!(s.work_time(), 0);
        s.publish(Work::default());
        let t1 = s.work_time();
        assert!(t1 > 0);
        s.publish(Work::default());
        assert!(s.work_time() >= t1);
    }

    #[test]
    fn invalidate_clears_time_and_version_word() {
        let s = state();
        let mut work = Work::default();
        work.data[0] = 42;
        s.publish(work);
        s.invalidate_work();
        let (work, time) = s.snapshot();
        assert_eq!(time, 0);
        assert_eq!(work.data[0], 0);
    }

    #[test]
    fn restart_flags_are_per_worker_and_consumed_once() {
        let s = state();
        s.restart_all();
        assert!(s.take_restart(0));
        assert!(!s.take_restart(0));
        assert!(s.take_restart(1));
    }

    #[test]
    fn snapshot_carries_pool_id() {
        let s = state();
        let mut work = Work::default();
        work.pooln = 3;
        s.publish(work);
        let (work, _) = s.snapshot();
        assert_eq!(work.pooln, 3);
    }
}
