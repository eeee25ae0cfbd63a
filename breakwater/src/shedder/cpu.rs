// breakwater/src/shedder/cpu.rs
//
// CPU-driven shedding. One instance is shared by every controller in the
// process: shedding starts only once the *shared* CPU capacity is hit.
//
// Overloaded: smoothed usage > upper bound, checked once per window. The
//             usage itself is refreshed off the admission path, by a
//             CpuSampler thread (or explicitly through `sample`).
// Cool-off:   after an overload the watermark may keep tightening but must not
//             loosen until `cool_off` has passed since the last overload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Heuristics;
use crate::error::Result;
use crate::load::{SmoothedLoad, SystemLoadProvider};
use crate::shedder::{OverloadDetector, WorkloadShedder};
use crate::smoother::Ema;
use crate::window::WindowState;

pub type CpuShedder = WorkloadShedder<CpuOverload>;

pub struct CpuOverload {
    load:          Arc<SmoothedLoad>,
    upper_bound:   f64,
    cool_off:      Duration,
    last_overload: Mutex<Option<Instant>>,
}

impl CpuOverload {
    pub fn new(load: Arc<SmoothedLoad>, upper_bound: f64, cool_off: Duration) -> Self {
        Self { load, upper_bound, cool_off, last_overload: Mutex::new(None) }
    }

    pub fn from_heuristics(provider: Arc<dyn SystemLoadProvider>, h: &Heuristics) -> Self {
        let load = SmoothedLoad::new(provider, Ema::clamped(h.cpu_ema_alpha));
        Self::new(Arc::new(load), h.cpu_usage_upper_bound, h.cpu_overload_cool_off())
    }

    /// The smoothed load this detector reads; hand it to a `CpuSampler`.
    pub fn load(&self) -> &Arc<SmoothedLoad> {
        &self.load
    }

    /// Pull one reading into the smoothed load now.
    pub fn sample(&self) -> f64 {
        self.load.refresh()
    }

    pub fn smoothed_cpu_usage(&self) -> f64 {
        self.load.smoothed()
    }

    pub fn last_overload(&self) -> Option<Instant> {
        *self.last_overload.lock()
    }

    fn cooling_off(&self, now: Instant) -> bool {
        match self.last_overload() {
            Some(at) => now.saturating_duration_since(at) < self.cool_off,
            None => false,
        }
    }
}

impl OverloadDetector for CpuOverload {
    fn is_overloaded(&self, now: Instant, _retiring: &WindowState) -> bool {
        let usage = self.load.smoothed();
        let overloaded = usage > self.upper_bound;
        if overloaded {
            *self.last_overload.lock() = Some(now);
            warn!(smooth = usage, bound = self.upper_bound, "CPU overloaded");
        }
        overloaded
    }

    fn may_recover(&self, now: Instant) -> bool {
        let cooling = self.cooling_off(now);
        if cooling {
            debug!(cool_off_secs = self.cool_off.as_secs(), "CPU cooling off");
        }
        !cooling
    }
}

impl WorkloadShedder<CpuOverload> {
    pub fn cpu(name: impl Into<String>, provider: Arc<dyn SystemLoadProvider>, h: &Heuristics) -> Result<Self> {
        h.validate()?;
        Ok(Self::new(name, CpuOverload::from_heuristics(provider, h), h))
    }

    pub fn smoothed_cpu_usage(&self) -> f64 {
        self.detector().smoothed_cpu_usage()
    }
}
