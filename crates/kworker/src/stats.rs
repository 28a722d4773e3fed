//! Worker statistics, printed when `KWORKER_STATS` is set.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub jobs_run: AtomicU64,
    pub cached_file_hits: AtomicU64,
    pub cached_file_misses: AtomicU64,
    pub digests_computed: AtomicU64,
    pub digests_cached: AtomicU64,
    pub temp_bytes_written: AtomicU64,
    pub handle_high_water: AtomicU64,
    pub modules_reset: AtomicU64,
    pub handles_leaked: AtomicU64,
    pub restarts_scheduled: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn max(counter: &AtomicU64, n: u64) {
        counter.fetch_max(n, Ordering::Relaxed);
    }

    pub fn report(&self) -> String {
        let g = |c: &AtomicU64| c.load(Ordering::Relaxed);
        format!(
            "kWorker stats: jobs={} file-cache={}/{} (hit/miss) digests={}+{} (computed+cached) \
             temp-bytes={} handle-high-water={} module-resets={} leaked-handles={} restarts={}",
            g(&self.jobs_run),
            g(&self.cached_file_hits),
            g(&self.cached_file_misses),
            g(&self.digests_computed),
            g(&self.digests_cached),
            g(&self.temp_bytes_written),
            g(&self.handle_high_water),
            g(&self.modules_reset),
            g(&self.handles_leaked),
            g(&self.restarts_scheduled),
        )
    }

    pub fn print(&self) {
        eprintln!("{}", self.report());
    }
}
