// breakwater/src/load.rs
//
// CPU load sources.
//
//   SystemLoadProvider   utilization in [0.0, 1.0], or None when no fresh
//                        reading is available yet
//   ProcessCpu           this process: utime+stime from /proc/self/stat over
//                        wall time and online CPUs (Linux; the default)
//   ProcStatCpu          host-wide usage from /proc/stat deltas (Linux)
//   FixedLoad            settable value, for tests and simulations
//   SmoothedLoad         provider + EMA; readers see the last smoothed value
//                        through an atomic and never lock
//   CpuSampler           background thread that owns the writer side of a
//                        SmoothedLoad, so the admission path never does I/O

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::smoother::{Ema, ValueSmoother};

pub trait SystemLoadProvider: Send + Sync {
    /// Recent CPU utilization, `[0.0, 1.0]`. `None` means nothing new to
    /// report (no baseline yet, or counters have not advanced); callers keep
    /// their previous value. May do I/O: call it from a sampler, not inline.
    fn cpu_usage(&self) -> Option<f64>;
}

// ── Fixed ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FixedLoad(AtomicU64);

impl FixedLoad {
    pub fn new(usage: f64) -> Self {
        Self(AtomicU64::new(usage.to_bits()))
    }

    pub fn set(&self, usage: f64) {
        self.0.store(usage.to_bits(), Ordering::Relaxed);
    }
}

impl SystemLoadProvider for FixedLoad {
    fn cpu_usage(&self) -> Option<f64> {
        Some(f64::from_bits(self.0.load(Ordering::Relaxed)))
    }
}

// ── /proc/self/stat ───────────────────────────────────────────────────────────

/// Kernel USER_HZ: the unit of every tick count exported through /proc.
const USER_HZ: f64 = 100.0;
/// Shorter spans are below tick resolution and report nothing.
const MIN_SPAN: Duration = Duration::from_millis(50);

/// CPU time of this process divided by elapsed wall time and online CPUs.
/// Neighbouring processes do not count against it.
#[derive(Debug)]
pub struct ProcessCpu {
    cpus: f64,
    prev: Mutex<Option<(u64, Instant)>>,
}

impl Default for ProcessCpu {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self { cpus: cpus as f64, prev: Mutex::new(None) }
    }
}

impl ProcessCpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline is only replaced when a usage value is produced.
    fn usage_since(&self, ticks: u64, now: Instant) -> Option<f64> {
        let mut prev = self.prev.lock();
        let Some((before, at)) = *prev else {
            *prev = Some((ticks, now));
            return None;
        };
        let span = now.saturating_duration_since(at);
        if span < MIN_SPAN {
            return None;
        }
        let busy = ticks.saturating_sub(before) as f64 / USER_HZ;
        *prev = Some((ticks, now));
        Some((busy / (span.as_secs_f64() * self.cpus)).clamp(0.0, 1.0))
    }
}

impl SystemLoadProvider for ProcessCpu {
    fn cpu_usage(&self) -> Option<f64> {
        match std::fs::read_to_string("/proc/self/stat") {
            Ok(stat) => match parse_self_stat(&stat) {
                Some(ticks) => self.usage_since(ticks, Instant::now()),
                None => {
                    debug!("unparseable /proc/self/stat");
                    None
                }
            },
            Err(e) => {
                debug!("read /proc/self/stat: {}", e);
                None
            }
        }
    }
}

// "pid (comm) state ppid ... utime stime ..."; comm may hold spaces or ')'
fn parse_self_stat(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // after comm: field 3 (state) is index 0, so utime(14)=11, stime(15)=12
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some(utime + stime)
}

// ── /proc/stat ────────────────────────────────────────────────────────────────

/// Host-wide usage between two readings whose counters moved. Other
/// processes count too; prefer [`ProcessCpu`] unless the host is dedicated.
#[derive(Debug, Default)]
pub struct ProcStatCpu {
    prev: Mutex<Option<CpuTimes>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle:  u64,
}

impl ProcStatCpu {
    pub fn new() -> Self {
        Self::default()
    }

    fn usage_since(&self, now: CpuTimes) -> Option<f64> {
        let mut prev = self.prev.lock();
        let Some(before) = *prev else {
            *prev = Some(now);
            return None;
        };
        let total = now.total.saturating_sub(before.total);
        if total == 0 {
            // no tick since the baseline: keep it, report nothing
            return None;
        }
        let idle = now.idle.saturating_sub(before.idle);
        *prev = Some(now);
        Some((1.0 - idle as f64 / total as f64).clamp(0.0, 1.0))
    }
}

impl SystemLoadProvider for ProcStatCpu {
    fn cpu_usage(&self) -> Option<f64> {
        match std::fs::read_to_string("/proc/stat") {
            Ok(stat) => match parse_cpu_line(&stat) {
                Some(times) => self.usage_since(times),
                None => {
                    debug!("unparseable /proc/stat");
                    None
                }
            },
            Err(e) => {
                debug!("read /proc/stat: {}", e);
                None
            }
        }
    }
}

// "cpu  user nice system idle iowait irq softirq steal guest guest_nice"
fn parse_cpu_line(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    // guest time is already counted in user/nice
    let total = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes { total, idle })
}

// ── Smoothed ──────────────────────────────────────────────────────────────────

pub struct SmoothedLoad {
    provider: Arc<dyn SystemLoadProvider>,
    smoother: Mutex<Ema>,
    latest:   AtomicU64, // f64 bits
}

impl SmoothedLoad {
    pub fn new(provider: Arc<dyn SystemLoadProvider>, smoother: Ema) -> Self {
        Self { provider, smoother: Mutex::new(smoother), latest: AtomicU64::new(0f64.to_bits()) }
    }

    /// Sample the provider, fold a fresh reading into the EMA and publish
    /// the result. Without a fresh reading the published value stands.
    pub fn refresh(&self) -> f64 {
        let Some(raw) = self.provider.cpu_usage() else {
            return self.smoothed();
        };
        let smoothed = self.smoother.lock().update(raw).smoothed_value();
        self.latest.store(smoothed.to_bits(), Ordering::Release);
        debug!(cpu = raw, smooth = smoothed, "cpu sampled");
        smoothed
    }

    /// Last published smoothed usage; 0.0 before the first fresh reading.
    pub fn smoothed(&self) -> f64 {
        f64::from_bits(self.latest.load(Ordering::Acquire))
    }
}

// ── Sampler ───────────────────────────────────────────────────────────────────

/// Refreshes a [`SmoothedLoad`] every `interval` on its own thread. The
/// thread holds only a weak reference and exits once the load is dropped.
pub struct CpuSampler;

impl CpuSampler {
    pub fn spawn(load: &Arc<SmoothedLoad>, interval: Duration) -> io::Result<JoinHandle<()>> {
        let load: Weak<SmoothedLoad> = Arc::downgrade(load);
        let handle = thread::Builder::new()
            .name("breakwater-cpu".into())
            .spawn(move || {
                while let Some(load) = load.upgrade() {
                    load.refresh();
                    drop(load);
                    thread::sleep(interval);
                }
                debug!("cpu sampler stopped");
            })?;
        info!(interval_ms = interval.as_millis() as u64, "cpu sampler started");
        Ok(handle)
    }
}
