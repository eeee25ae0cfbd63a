// breakwater/src/window/state.rs
//
// Statistics of one tumbling window.
//
// Every counter is an independent atomic: samplers never lock each other, and
// no ordering holds between counters. The histogram is a DashMap (sharded,
// unsorted) keyed by P; it is sorted once, at swap time, by `histogram()`.
//
// Invariants while the window is current:
//   admitted <= requested
//   sum(histogram) == requested     (modulo samples racing a swap)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::priority::Priority;

#[derive(Debug)]
pub struct WindowState {
    start:     Instant,
    requested: AtomicU64,
    admitted:  AtomicU64,
    queued_ns: AtomicU64,
    histogram: DashMap<u16, AtomicU64>, // bucket key (P by default) → requested
}

impl WindowState {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            requested: AtomicU64::new(0),
            admitted:  AtomicU64::new(0),
            queued_ns: AtomicU64::new(0),
            histogram: DashMap::new(),
        }
    }

    pub fn sample(&self, priority: Priority, admitted: bool) {
        self.record(priority.P(), admitted);
    }

    /// Like `sample`, with the histogram bucket key chosen by the caller.
    pub fn record(&self, key: u16, admitted: bool) {
        self.requested.fetch_add(1, Ordering::Relaxed);
        if admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        }

        let p = key;
        if let Some(bucket) = self.histogram.get(&p) {
            bucket.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.histogram
            .entry(p)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_queued(&self, delay: Duration) {
        let ns = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        self.queued_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }

    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn shed(&self) -> u64 {
        self.requested().saturating_sub(self.admitted())
    }

    /// Average queued time per request; zero for an empty window.
    pub fn avg_queued(&self) -> Duration {
        let requested = self.requested();
        if requested == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.queued_ns.load(Ordering::Relaxed) / requested)
    }

    /// Sorted snapshot: P → requests seen at that P.
    pub fn histogram(&self) -> BTreeMap<u16, u64> {
        self.histogram
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect()
    }
}
