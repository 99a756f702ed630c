use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{PassSummary, RunStatus};

/// Pipeline counters, updated once per pass and read by `/stats`.
#[derive(Default)]
pub struct Stats {
    started_ms: AtomicU64,
    next_log_ms: AtomicU64,

    passes: AtomicU64,
    passes_with_failures: AtomicU64,
    last_pass_ms: AtomicU64,

    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    fetch_errors: AtomicU64,

    records_fetched: AtomicU64,
    records_stored: AtomicU64,
    records_skipped: AtomicU64,
}

impl Stats {
    pub fn new(now_ms: u64) -> Arc<Self> {
        let s = Self::default();
        s.started_ms.store(now_ms, Ordering::Relaxed);
        Arc::new(s)
    }

    pub fn record_pass(&self, pass: &PassSummary) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.last_pass_ms.store(pass.duration_ms, Ordering::Relaxed);
        if pass.failed() > 0 {
            self.passes_with_failures.fetch_add(1, Ordering::Relaxed);
        }

        for r in &pass.sources {
            let runs = match r.status {
                RunStatus::Completed => &self.runs_completed,
                RunStatus::Failed => &self.runs_failed,
            };
            runs.fetch_add(1, Ordering::Relaxed);
            if r.fetch_error.is_some() {
                self.fetch_errors.fetch_add(1, Ordering::Relaxed);
            }
            self.records_fetched.fetch_add(r.records_fetched as u64, Ordering::Relaxed);
            self.records_stored.fetch_add(r.records_processed as u64, Ordering::Relaxed);
            self.records_skipped.fetch_add(r.records_skipped as u64, Ordering::Relaxed);
        }
    }

    /// Snapshot to log when `every_sec` has elapsed since the last one was
    /// handed out. The first call after start is always due. `every_sec == 0`
    /// turns periodic logging off.
    pub fn log_due(&self, now_ms: u64, every_sec: u64) -> Option<StatsSnapshot> {
        if every_sec == 0 {
            return None;
        }
        let due = self.next_log_ms.load(Ordering::Relaxed);
        if now_ms < due {
            return None;
        }
        let next = now_ms.saturating_add(every_sec.saturating_mul(1000));
        self.next_log_ms
            .compare_exchange(due, next, Ordering::Relaxed, Ordering::Relaxed)
            .ok()
            .map(|_| self.snapshot(now_ms))
    }

    pub fn snapshot(&self, now_ms: u64) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            up_sec: now_ms.saturating_sub(get(&self.started_ms)) / 1000,
            passes: get(&self.passes),
            passes_with_failures: get(&self.passes_with_failures),
            last_pass_ms: get(&self.last_pass_ms),
            runs_completed: get(&self.runs_completed),
            runs_failed: get(&self.runs_failed),
            fetch_errors: get(&self.fetch_errors),
            records_fetched: get(&self.records_fetched),
            records_stored: get(&self.records_stored),
            records_skipped: get(&self.records_skipped),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub up_sec: u64,
    pub passes: u64,
    pub passes_with_failures: u64,
    pub last_pass_ms: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub fetch_errors: u64,
    pub records_fetched: u64,
    pub records_stored: u64,
    pub records_skipped: u64,
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
