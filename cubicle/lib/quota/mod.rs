//! Per-sandbox quota buckets and admission.
//!
//! Admission is totally ordered per sandbox: each bucket sits behind its own
//! mutex, so two concurrent `admit_exec` calls can never both observe headroom
//! that only one request's worth exists.

use std::{sync::Arc, time::Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::{config::QuotaLimits, metrics::Metrics, CubicleError, CubicleResult, QuotaKind};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Number of slots in the rolling execution window: one per minute of an hour.
const WINDOW_SLOTS: usize = 60;

/// Soft warnings fire when utilization crosses this fraction of a hard cap.
const WARN_THRESHOLD: f64 = 0.8;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Tracks and enforces per-sandbox resource quotas.
pub struct QuotaManager {
    limits: QuotaLimits,
    metrics: Arc<Metrics>,
    buckets: DashMap<String, Mutex<QuotaBucket>>,
    epoch: Instant,
}

/// Rolling counters for one sandbox.
struct QuotaBucket {
    /// Exec counts bucketed into fixed minute slots.
    exec_slots: [u32; WINDOW_SLOTS],

    /// Absolute minute index each slot was last written in.
    slot_minutes: [u64; WINDOW_SLOTS],

    concurrent_exec: u32,
    memory_estimate_bytes: u64,
    storage_bytes: u64,
    egress_bytes: u64,
    cpu_seconds: u64,

    /// One-shot warn latches, reset when utilization drops below the threshold.
    warned_exec_rate: bool,
    warned_memory: bool,
    warned_storage: bool,
}

/// A point-in-time usage report for one sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    /// The sandbox the report is for.
    pub sandbox_id: String,

    /// Executions recorded in the rolling one-hour window.
    pub exec_count_window: u32,

    /// Executions currently running.
    pub concurrent_exec: u32,

    /// Estimated resident memory in bytes.
    pub memory_estimate_bytes: u64,

    /// Workspace storage in bytes.
    pub storage_bytes: u64,

    /// Egress bytes recorded in the rolling window.
    pub egress_bytes: u64,

    /// CPU seconds recorded in the rolling window.
    pub cpu_seconds: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl QuotaManager {
    /// Creates a manager enforcing the configured limits.
    pub fn new(limits: QuotaLimits, metrics: Arc<Metrics>) -> Self {
        Self {
            limits,
            metrics,
            buckets: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Registers a bucket for a new sandbox.
    pub fn register(&self, sandbox_id: &str) {
        self.buckets
            .entry(sandbox_id.to_string())
            .or_insert_with(|| Mutex::new(QuotaBucket::new()));
    }

    /// Drops a sandbox's bucket.
    pub fn unregister(&self, sandbox_id: &str) {
        self.buckets.remove(sandbox_id);
    }

    /// Atomically checks every hard cap and admits one execution.
    ///
    /// On rejection the specific violation kind is returned and
    /// `quota_violations_total{kind}` is incremented. Admitted executions must
    /// be paired with [`release_exec`](Self::release_exec).
    pub fn admit_exec(&self, sandbox_id: &str) -> CubicleResult<()> {
        let minute = self.current_minute();
        let entry = self
            .buckets
            .get(sandbox_id)
            .ok_or_else(|| CubicleError::NotFound(format!("unknown sandbox: {}", sandbox_id)))?;
        let mut bucket = entry.lock();

        let window_count = bucket.roll_and_count(minute);

        if let Err(kind) = bucket.check_caps(window_count, &self.limits) {
            drop(bucket);
            self.metrics
                .quota_violations_total
                .with_label_values(&[kind.as_str()])
                .inc();
            return Err(CubicleError::QuotaExceeded(kind));
        }

        bucket.warn_on_crossings(sandbox_id, window_count, &self.limits);
        bucket.exec_slots[(minute % WINDOW_SLOTS as u64) as usize] += 1;
        bucket.concurrent_exec += 1;
        Ok(())
    }

    /// Releases one admitted execution.
    pub fn release_exec(&self, sandbox_id: &str) {
        if let Some(entry) = self.buckets.get(sandbox_id) {
            let mut bucket = entry.lock();
            bucket.concurrent_exec = bucket.concurrent_exec.saturating_sub(1);
        }
    }

    /// Records an updated memory estimate.
    pub fn record_memory(&self, sandbox_id: &str, bytes: u64) {
        self.record(sandbox_id, |b| b.memory_estimate_bytes = bytes);
    }

    /// Records an updated workspace storage size.
    pub fn record_storage(&self, sandbox_id: &str, bytes: u64) {
        self.record(sandbox_id, |b| b.storage_bytes = bytes);
    }

    /// Adds egress bytes to the rolling window total.
    pub fn record_egress(&self, sandbox_id: &str, bytes: u64) {
        self.record(sandbox_id, |b| b.egress_bytes += bytes);
    }

    /// Adds CPU seconds to the rolling window total.
    pub fn record_cpu(&self, sandbox_id: &str, seconds: u64) {
        self.record(sandbox_id, |b| b.cpu_seconds += seconds);
    }

    /// Produces a usage report for one sandbox.
    pub fn usage(&self, sandbox_id: &str) -> CubicleResult<QuotaUsage> {
        let minute = self.current_minute();
        let entry = self
            .buckets
            .get(sandbox_id)
            .ok_or_else(|| CubicleError::NotFound(format!("unknown sandbox: {}", sandbox_id)))?;
        let mut bucket = entry.lock();
        let window_count = bucket.roll_and_count(minute);

        Ok(QuotaUsage {
            sandbox_id: sandbox_id.to_string(),
            exec_count_window: window_count,
            concurrent_exec: bucket.concurrent_exec,
            memory_estimate_bytes: bucket.memory_estimate_bytes,
            storage_bytes: bucket.storage_bytes,
            egress_bytes: bucket.egress_bytes,
            cpu_seconds: bucket.cpu_seconds,
        })
    }

    fn record(&self, sandbox_id: &str, f: impl FnOnce(&mut QuotaBucket)) {
        if let Some(entry) = self.buckets.get(sandbox_id) {
            f(&mut entry.lock());
        }
    }

    fn current_minute(&self) -> u64 {
        self.epoch.elapsed().as_secs() / 60
    }
}

impl QuotaBucket {
    fn new() -> Self {
        Self {
            exec_slots: [0; WINDOW_SLOTS],
            slot_minutes: [0; WINDOW_SLOTS],
            concurrent_exec: 0,
            memory_estimate_bytes: 0,
            storage_bytes: 0,
            egress_bytes: 0,
            cpu_seconds: 0,
            warned_exec_rate: false,
            warned_memory: false,
            warned_storage: false,
        }
    }

    /// Expires stale slots and returns the rolling-window exec count.
    fn roll_and_count(&mut self, minute: u64) -> u32 {
        let mut count = 0;
        for i in 0..WINDOW_SLOTS {
            if minute.saturating_sub(self.slot_minutes[i]) >= WINDOW_SLOTS as u64 {
                self.exec_slots[i] = 0;
                self.slot_minutes[i] = minute;
            }
            count += self.exec_slots[i];
        }
        // Claim the current slot for this minute.
        let slot = (minute % WINDOW_SLOTS as u64) as usize;
        if self.slot_minutes[slot] != minute {
            count -= self.exec_slots[slot];
            self.exec_slots[slot] = 0;
            self.slot_minutes[slot] = minute;
        }
        count
    }

    fn check_caps(&self, window_count: u32, limits: &QuotaLimits) -> Result<(), QuotaKind> {
        if window_count >= *limits.get_max_exec_per_hour() {
            return Err(QuotaKind::ExecRate);
        }
        if self.concurrent_exec >= *limits.get_max_concurrent_exec() {
            return Err(QuotaKind::ConcurrentExec);
        }
        if self.memory_estimate_bytes > *limits.get_max_memory_bytes() {
            return Err(QuotaKind::Memory);
        }
        if self.storage_bytes > *limits.get_max_storage_bytes() {
            return Err(QuotaKind::Storage);
        }
        if self.egress_bytes > *limits.get_max_egress_bytes_per_hour() {
            return Err(QuotaKind::Egress);
        }
        if self.cpu_seconds > *limits.get_max_cpu_seconds_per_hour() {
            return Err(QuotaKind::Cpu);
        }
        Ok(())
    }

    /// Emits one warning per crossing of the soft threshold.
    fn warn_on_crossings(&mut self, sandbox_id: &str, window_count: u32, limits: &QuotaLimits) {
        self.warned_exec_rate = warn_once(
            self.warned_exec_rate,
            window_count as f64,
            *limits.get_max_exec_per_hour() as f64,
            sandbox_id,
            "exec rate",
        );
        self.warned_memory = warn_once(
            self.warned_memory,
            self.memory_estimate_bytes as f64,
            *limits.get_max_memory_bytes() as f64,
            sandbox_id,
            "memory",
        );
        self.warned_storage = warn_once(
            self.warned_storage,
            self.storage_bytes as f64,
            *limits.get_max_storage_bytes() as f64,
            sandbox_id,
            "storage",
        );
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn warn_once(already: bool, used: f64, cap: f64, sandbox_id: &str, what: &str) -> bool {
    let over = cap > 0.0 && used / cap >= WARN_THRESHOLD;
    if over && !already {
        warn!(sandbox_id, what, used, cap, "approaching quota limit");
    }
    over
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(limits: QuotaLimits) -> QuotaManager {
        QuotaManager::new(limits, Metrics::new().unwrap())
    }

    fn limits(yaml: &str) -> QuotaLimits {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_exec_rate_cap() {
        let manager = manager(limits("max_exec_per_hour: 3"));
        manager.register("sbx_a");

        for _ in 0..3 {
            manager.admit_exec("sbx_a").unwrap();
            manager.release_exec("sbx_a");
        }
        let result = manager.admit_exec("sbx_a");
        assert!(matches!(
            result,
            Err(CubicleError::QuotaExceeded(QuotaKind::ExecRate))
        ));
        assert_eq!(
            manager
                .metrics
                .quota_violations_total
                .with_label_values(&["exec_rate"])
                .get(),
            1
        );
    }

    #[test]
    fn test_concurrency_cap_exactly_one_wins() {
        let manager = Arc::new(manager(limits("max_concurrent_exec: 1")));
        manager.register("sbx_a");

        // Only one unit of headroom: exactly one of two racing admissions may
        // succeed.
        let m1 = manager.clone();
        let m2 = manager.clone();
        let h1 = std::thread::spawn(move || m1.admit_exec("sbx_a").is_ok());
        let h2 = std::thread::spawn(move || m2.admit_exec("sbx_a").is_ok());
        let results = [h1.join().unwrap(), h2.join().unwrap()];

        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(
            manager
                .metrics
                .quota_violations_total
                .with_label_values(&["concurrent_exec"])
                .get(),
            1
        );
    }

    #[test]
    fn test_release_restores_headroom() {
        let manager = manager(limits("max_concurrent_exec: 1"));
        manager.register("sbx_a");

        manager.admit_exec("sbx_a").unwrap();
        assert!(manager.admit_exec("sbx_a").is_err());
        manager.release_exec("sbx_a");
        manager.admit_exec("sbx_a").unwrap();
    }

    #[test]
    fn test_storage_cap() {
        let manager = manager(limits("max_storage_bytes: 1000"));
        manager.register("sbx_a");

        manager.record_storage("sbx_a", 999);
        manager.admit_exec("sbx_a").unwrap();
        manager.release_exec("sbx_a");

        manager.record_storage("sbx_a", 1001);
        assert!(matches!(
            manager.admit_exec("sbx_a"),
            Err(CubicleError::QuotaExceeded(QuotaKind::Storage))
        ));
    }

    #[test]
    fn test_unknown_sandbox_is_not_found() {
        let manager = manager(QuotaLimits::default());
        assert!(matches!(
            manager.admit_exec("sbx_ghost"),
            Err(CubicleError::NotFound(_))
        ));
    }

    #[test]
    fn test_usage_report() {
        let manager = manager(QuotaLimits::default());
        manager.register("sbx_a");
        manager.admit_exec("sbx_a").unwrap();
        manager.record_memory("sbx_a", 42);
        manager.record_egress("sbx_a", 10);
        manager.record_egress("sbx_a", 5);

        let usage = manager.usage("sbx_a").unwrap();
        assert_eq!(usage.exec_count_window, 1);
        assert_eq!(usage.concurrent_exec, 1);
        assert_eq!(usage.memory_estimate_bytes, 42);
        assert_eq!(usage.egress_bytes, 15);
    }

    #[test]
    fn test_window_rolls_off() {
        let mut bucket = QuotaBucket::new();
        // Three execs in minute 0.
        assert_eq!(bucket.roll_and_count(0), 0);
        bucket.exec_slots[0] = 3;
        bucket.slot_minutes[0] = 0;

        // Still visible 59 minutes later.
        assert_eq!(bucket.roll_and_count(59), 3);
        // Expired one window later.
        assert_eq!(bucket.roll_and_count(60), 0);
    }
}
