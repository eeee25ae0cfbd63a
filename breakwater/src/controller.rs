// breakwater/src/controller.rs
//
// Admission controller facade + process-wide registry.
//
//   admit(workload)
//     ├─ shared CPU shedder    global gate, one per process
//     └─ named queue shedder   per-endpoint gate, one per controller
//
// Feedback (overload events, queued delays) goes to the queue shedder only;
// the CPU shedder samples its own load source.
//
// Limits: only new admissions are gated. Work already accepted (running or
// sitting in a queue) is never shed, even if it exhausts the CPU.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::Heuristics;
use crate::error::Result;
use crate::load::{CpuSampler, ProcessCpu};
use crate::metrics::{MetricsTracker, NopTracker};
use crate::priority::{Priority, Workload};
use crate::shedder::{AdmissionLevel, CpuOverload, CpuShedder, QueueOverload, QueueShedder};

static HEURISTICS: OnceLock<Heuristics> = OnceLock::new();
static SHARED_CPU: OnceLock<Arc<CpuShedder>> = OnceLock::new();
static REGISTRY: OnceLock<DashMap<String, Arc<AdmissionController>>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// Downstream reported overload at this instant.
    Overload { at: Instant },
    /// A unit of work waited this long in queue before running.
    Queued { delay: Duration },
}

impl Feedback {
    pub fn overload(at: Instant) -> Self {
        Self::Overload { at }
    }

    pub fn queued(delay: Duration) -> Self {
        Self::Queued { delay }
    }
}

pub struct AdmissionController {
    name:    String,
    cpu:     Arc<CpuShedder>,
    queue:   QueueShedder,
    tracker: Arc<dyn MetricsTracker>,
}

impl AdmissionController {
    /// Controller on the shared CPU shedder with process heuristics.
    /// Most callers want [`get_instance`] instead.
    pub fn new(name: &str) -> Self {
        let h = heuristics();
        Self {
            name:    name.to_string(),
            cpu:     shared_cpu_shedder(),
            queue:   QueueShedder::new(name, QueueOverload::new(h.queued_avg_upper_bound()), h),
            tracker: Arc::new(NopTracker),
        }
    }

    pub fn with_parts(
        name: &str,
        cpu: Arc<CpuShedder>,
        h: &Heuristics,
        tracker: Arc<dyn MetricsTracker>,
    ) -> Result<Self> {
        Ok(Self { name: name.to_string(), cpu, queue: QueueShedder::queue(name, h)?, tracker })
    }

    pub fn admit<W: Workload + ?Sized>(&self, workload: &W) -> bool {
        self.admit_at(workload.priority(), Instant::now())
    }

    pub fn admit_at(&self, priority: Priority, now: Instant) -> bool {
        self.tracker.enter(priority);

        if !self.cpu.admit_at(priority, now) {
            self.tracker.shed_by_cpu(priority);
            debug!(
                name = %self.name, priority = %priority.simple_string(),
                watermark = %self.cpu.watermark(), "shared CPU saturated, shed"
            );
            return false;
        }

        let ok = self.queue.admit_at(priority, now);
        if !ok {
            self.tracker.shed_by_queue(priority);
            debug!(
                name = %self.name, priority = %priority.simple_string(),
                watermark = %self.queue.watermark(), "queuing busy, shed"
            );
        }
        ok
    }

    pub fn feedback(&self, feedback: Feedback) {
        match feedback {
            Feedback::Overload { at } => self.queue.overload(at),
            Feedback::Queued { delay } => self.queue.add_queued(delay),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpu_watermark(&self) -> AdmissionLevel {
        self.cpu.watermark()
    }

    pub fn queue_watermark(&self) -> AdmissionLevel {
        self.queue.watermark()
    }

    pub fn cpu_shedder(&self) -> &Arc<CpuShedder> {
        &self.cpu
    }

    pub fn queue_shedder(&self) -> &QueueShedder {
        &self.queue
    }
}

/// Controller for `name`; the same instance for every caller and thread.
pub fn get_instance(name: &str) -> Arc<AdmissionController> {
    let registry = REGISTRY.get_or_init(DashMap::new);
    if let Some(existing) = registry.get(name) {
        return Arc::clone(existing.value());
    }
    let entry = registry
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(AdmissionController::new(name)));
    Arc::clone(entry.value())
}

/// The process-wide CPU shedder, built on first use. Its usage is this
/// process's CPU time, refreshed by a background sampler thread.
pub fn shared_cpu_shedder() -> Arc<CpuShedder> {
    let shared = SHARED_CPU.get_or_init(|| {
        let h = heuristics();
        let detector = CpuOverload::from_heuristics(Arc::new(ProcessCpu::new()), h);
        if let Err(e) = CpuSampler::spawn(detector.load(), h.cpu_sample_interval()) {
            warn!("cpu sampler not started, CPU gate stays open: {}", e);
        }
        Arc::new(CpuShedder::new("shared-cpu", detector, h))
    });
    Arc::clone(shared)
}

/// Process heuristics: defaults + `BREAKWATER_*` env, read once.
/// Invalid values fall back to defaults as a whole.
pub fn heuristics() -> &'static Heuristics {
    HEURISTICS.get_or_init(|| {
        let h = Heuristics::from_env();
        match h.validate() {
            Ok(()) => h,
            Err(e) => {
                warn!("{}, using default heuristics", e);
                Heuristics::default()
            }
        }
    })
}
