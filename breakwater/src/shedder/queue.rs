// breakwater/src/shedder/queue.rs
//
// Queueing-delay-driven shedding, one instance per controller name
// (per-endpoint backpressure).
//
// A window is overloaded when
//   - an explicit Overload feedback arrived at or after the window start, or
//   - the average queued time per request in the window exceeds the bound.
//
// Queued-delay feedback accumulates into whichever window is current.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Heuristics;
use crate::error::Result;
use crate::shedder::{OverloadDetector, WorkloadShedder};
use crate::window::WindowState;

pub type QueueShedder = WorkloadShedder<QueueOverload>;

pub struct QueueOverload {
    epoch:            Instant,
    last_overload_ns: AtomicU64, // offset from epoch + 1; 0 = never
    avg_upper_bound:  Duration,
}

impl QueueOverload {
    pub fn new(avg_upper_bound: Duration) -> Self {
        Self { epoch: Instant::now(), last_overload_ns: AtomicU64::new(0), avg_upper_bound }
    }

    pub fn record_overload(&self, at: Instant) {
        let offset = at.saturating_duration_since(self.epoch).as_nanos();
        let encoded = u64::try_from(offset).unwrap_or(u64::MAX - 1) + 1;
        self.last_overload_ns.fetch_max(encoded, Ordering::AcqRel);
    }

    pub fn last_overload(&self) -> Option<Instant> {
        match self.last_overload_ns.load(Ordering::Acquire) {
            0 => None,
            encoded => Some(self.epoch + Duration::from_nanos(encoded - 1)),
        }
    }
}

impl OverloadDetector for QueueOverload {
    fn is_overloaded(&self, _now: Instant, retiring: &WindowState) -> bool {
        if let Some(at) = self.last_overload() {
            if at >= retiring.start() {
                warn!(since_window_start_ms = (at - retiring.start()).as_millis() as u64, "overload feedback");
                return true;
            }
        }

        let avg = retiring.avg_queued();
        if avg > self.avg_upper_bound {
            warn!(
                avg_queued_ms = avg.as_millis() as u64,
                bound_ms = self.avg_upper_bound.as_millis() as u64,
                "queuing busy"
            );
            return true;
        }
        false
    }
}

impl WorkloadShedder<QueueOverload> {
    pub fn queue(name: impl Into<String>, h: &Heuristics) -> Result<Self> {
        h.validate()?;
        Ok(Self::new(name, QueueOverload::new(h.queued_avg_upper_bound()), h))
    }

    /// Downstream signalled overload at `at`.
    pub fn overload(&self, at: Instant) {
        debug!(name = %self.name(), "overload feedback received");
        self.detector().record_overload(at);
    }

    /// A unit of work waited `delay` in queue before running.
    pub fn add_queued(&self, delay: Duration) {
        self.current_window().add_queued(delay);
    }
}
