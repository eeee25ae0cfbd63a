// breakwater/src/lib.rs
//
// Breakwater: priority-aware adaptive admission control.
//
// Every request carries a Priority (B, U). Each controller decides admit/shed
// against two watermarks:
//
//   shared CPU shedder   one per process, driven by smoothed CPU usage
//   queue shedder        one per controller name, driven by queueing feedback
//
// Watermarks move once per tumbling window: tighter by a fraction of the last
// window's admitted volume when overloaded, looser when healthy. The most
// important priority (P = 0) is never shed.
//
//   use breakwater::{get_instance, Feedback, Priority};
//
//   let ctl = get_instance("orders");
//   if ctl.admit(&Priority::of(3, 17)?) {
//       // run it, then report how long it queued
//       ctl.feedback(Feedback::queued(waited));
//   }

pub mod config;
pub mod controller;
pub mod error;
pub mod load;
pub mod metrics;
pub mod priority;
pub mod shedder;
pub mod smoother;
pub mod window;

pub use config::{Heuristics, SheddingPolicy};
pub use controller::{get_instance, shared_cpu_shedder, AdmissionController, Feedback};
pub use error::{Error, Result};
pub use load::{CpuSampler, FixedLoad, ProcStatCpu, ProcessCpu, SmoothedLoad, SystemLoadProvider};
pub use metrics::{MetricsTracker, NopTracker, ShedCounters, ShedStats};
pub use priority::{Priority, Workload};
pub use shedder::{AdmissionLevel, CpuShedder, OverloadDetector, QueueShedder, WorkloadShedder};
pub use smoother::{Ema, Sma, ValueSmoother};
pub use window::{Bucketing, RolloverStrategy, TumblingWindow, WindowConfig, WindowState};
