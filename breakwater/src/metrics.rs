// breakwater/src/metrics.rs
//
// Observability hooks fired on the admission path. Fire-and-forget: a hook
// must never fail back into an admission decision.
//
//   NopTracker    default, does nothing
//   ShedCounters  atomic totals + snapshot, for dashboards and the simulator

use std::sync::atomic::{AtomicU64, Ordering};

use crate::priority::Priority;

pub trait MetricsTracker: Send + Sync {
    fn enter(&self, _priority: Priority) {}

    fn shed_by_cpu(&self, _priority: Priority) {}

    fn shed_by_queue(&self, _priority: Priority) {}
}

#[derive(Debug, Default)]
pub struct NopTracker;

impl MetricsTracker for NopTracker {}

#[derive(Debug, Default)]
pub struct ShedCounters {
    pub entered:       AtomicU64,
    pub shed_by_cpu:   AtomicU64,
    pub shed_by_queue: AtomicU64,
}

impl ShedCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ShedStats {
        ShedStats {
            entered:       self.entered.load(Ordering::Relaxed),
            shed_by_cpu:   self.shed_by_cpu.load(Ordering::Relaxed),
            shed_by_queue: self.shed_by_queue.load(Ordering::Relaxed),
        }
    }
}

impl MetricsTracker for ShedCounters {
    fn enter(&self, _priority: Priority) {
        self.entered.fetch_add(1, Ordering::Relaxed);
    }

    fn shed_by_cpu(&self, _priority: Priority) {
        self.shed_by_cpu.fetch_add(1, Ordering::Relaxed);
    }

    fn shed_by_queue(&self, _priority: Priority) {
        self.shed_by_queue.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShedStats {
    pub entered:       u64,
    pub shed_by_cpu:   u64,
    pub shed_by_queue: u64,
}

impl ShedStats {
    pub fn total_shed(&self) -> u64 {
        self.shed_by_cpu + self.shed_by_queue
    }

    pub fn admitted(&self) -> u64 {
        self.entered.saturating_sub(self.total_shed())
    }

    pub fn shed_rate(&self) -> f64 {
        if self.entered == 0 { 0.0 } else { self.total_shed() as f64 / self.entered as f64 }
    }

    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &ShedStats) -> ShedStats {
        ShedStats {
            entered:       self.entered.saturating_sub(earlier.entered),
            shed_by_cpu:   self.shed_by_cpu.saturating_sub(earlier.shed_by_cpu),
            shed_by_queue: self.shed_by_queue.saturating_sub(earlier.shed_by_queue),
        }
    }
}
