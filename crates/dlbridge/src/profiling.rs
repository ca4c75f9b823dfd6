//! Lightweight per-operation profiler.
//!
//! Everything here compiles to no-ops unless the `profiler` feature is enabled, so dispatch
//! entries can open scopes unconditionally.

#[cfg(feature = "profiler")]
use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
#[cfg(feature = "profiler")]
use std::time::Instant;

#[cfg(feature = "profiler")]
use serde::Serialize;

/// Aggregated statistics for one operation name.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "profiler", derive(Serialize))]
pub struct OpStat {
    pub name: String,
    pub calls: u64,
    pub failures: u64,
    pub total: Duration,
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Default, Clone, Copy)]
struct Stat {
    calls: u64,
    failures: u64,
    total_ns: u128,
}

#[cfg(feature = "profiler")]
struct Profiler {
    ops: Mutex<HashMap<&'static str, Stat>>,
    alloc_count: AtomicU64,
    alloc_bytes: AtomicU64,
    syncs: AtomicU64,
}

#[cfg(feature = "profiler")]
impl Profiler {
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            ops: Mutex::new(HashMap::new()),
            alloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        })
    }

    fn record(&self, name: &'static str, elapsed: Duration, failed: bool) {
        if let Ok(mut ops) = self.ops.lock() {
            let stat = ops.entry(name).or_default();
            stat.calls += 1;
            stat.failures += u64::from(failed);
            stat.total_ns += elapsed.as_nanos();
        }
    }
}

/// Times one bridged operation until dropped.
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    name: &'static str,
    #[cfg(feature = "profiler")]
    start: Instant,
    #[cfg(feature = "profiler")]
    failed: bool,
}

impl ScopeGuard {
    /// Marks the scope as failed; failures are counted separately from calls.
    #[inline(always)]
    pub fn fail(&mut self) {
        #[cfg(feature = "profiler")]
        {
            self.failed = true;
        }
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        Profiler::instance().record(self.name, self.start.elapsed(), self.failed);
    }
}

#[inline(always)]
pub fn op_scope(name: &'static str) -> ScopeGuard {
    #[cfg(feature = "profiler")]
    {
        ScopeGuard {
            name,
            start: Instant::now(),
            failed: false,
        }
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
        ScopeGuard {}
    }
}

#[inline(always)]
pub fn record_allocation(bytes: usize) {
    #[cfg(feature = "profiler")]
    {
        let profiler = Profiler::instance();
        profiler.alloc_count.fetch_add(1, Ordering::Relaxed);
        profiler
            .alloc_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = bytes;
    }
}

#[inline(always)]
pub fn record_sync() {
    #[cfg(feature = "profiler")]
    {
        Profiler::instance().syncs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns per-operation statistics sorted by name. Empty without the `profiler` feature.
pub fn snapshot() -> Vec<OpStat> {
    #[cfg(feature = "profiler")]
    {
        let Ok(ops) = Profiler::instance().ops.lock() else {
            return Vec::new();
        };
        let mut out: Vec<OpStat> = ops
            .iter()
            .map(|(name, stat)| OpStat {
                name: (*name).to_string(),
                calls: stat.calls,
                failures: stat.failures,
                total: Duration::from_nanos(stat.total_ns.min(u64::MAX as u128) as u64),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
    #[cfg(not(feature = "profiler"))]
    {
        Vec::new()
    }
}

pub fn reset() {
    #[cfg(feature = "profiler")]
    {
        let profiler = Profiler::instance();
        if let Ok(mut ops) = profiler.ops.lock() {
            ops.clear();
        }
        profiler.alloc_count.store(0, Ordering::Relaxed);
        profiler.alloc_bytes.store(0, Ordering::Relaxed);
        profiler.syncs.store(0, Ordering::Relaxed);
    }
}

#[cfg(feature = "profiler")]
#[derive(Serialize)]
struct Report {
    ops: Vec<OpStat>,
    alloc_count: u64,
    alloc_bytes: u64,
    syncs: u64,
}

/// Serializes the current statistics as JSON and resets them.
#[cfg(feature = "profiler")]
pub fn take_report_json() -> Option<String> {
    let profiler = Profiler::instance();
    let report = Report {
        ops: snapshot(),
        alloc_count: profiler.alloc_count.load(Ordering::Relaxed),
        alloc_bytes: profiler.alloc_bytes.load(Ordering::Relaxed),
        syncs: profiler.syncs.load(Ordering::Relaxed),
    };
    reset();
    serde_json::to_string(&report).ok()
}

#[cfg(not(feature = "profiler"))]
pub fn take_report_json() -> Option<String> {
    None
}

#[cfg(all(test, not(feature = "profiler")))]
mod tests {
    use super::*;

    #[test]
    fn disabled_profiler_reports_nothing() {
        let mut scope = op_scope("fill_");
        scope.fail();
        drop(scope);
        record_allocation(16);
        record_sync();
        assert!(snapshot().is_empty());
        assert!(take_report_json().is_none());
    }
}
