// breakwater/src/shedder/mod.rs
//
// Workload shedder: the per-window control loop.
//
// Every admit samples into the current tumbling window. When a window fills,
// the single swap winner re-plans the watermark for the next window from the
// retiring window's histogram:
//
//   overloaded        → drop more:  shed drop_rate × last admitted volume,
//                                   walking buckets downward from the watermark
//   healthy           → admit more: regain recover_rate × last admitted volume,
//                                   walking shed buckets upward
//   cooling off       → hold
//
// Targeting a fraction of observed demand keeps the loop self-scaling across
// traffic volumes. Which signal means "overloaded" is up to the detector.

pub mod cpu;
pub mod level;
pub mod queue;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{Heuristics, SheddingPolicy};
use crate::priority::Priority;
use crate::window::{Bucketing, TumblingWindow, WindowConfig, WindowState};

pub use cpu::{CpuOverload, CpuShedder};
pub use level::{AdmissionLevel, Watermark};
pub use queue::{QueueOverload, QueueShedder};

/// Overload signal consulted once per window, by the swap winner only.
pub trait OverloadDetector: Send + Sync + 'static {
    fn is_overloaded(&self, now: Instant, retiring: &WindowState) -> bool;

    /// Whether the watermark may loosen when not overloaded.
    fn may_recover(&self, _now: Instant) -> bool {
        true
    }
}

pub struct WorkloadShedder<D: OverloadDetector> {
    core:   Arc<ShedderCore<D>>,
    window: TumblingWindow,
}

struct ShedderCore<D> {
    name:      String,
    watermark: Watermark,
    policy:    SheddingPolicy,
    bucketing: Bucketing,
    detector:  D,
}

impl<D: OverloadDetector> WorkloadShedder<D> {
    pub fn new(name: impl Into<String>, detector: D, heuristics: &Heuristics) -> Self {
        Self::with_window(
            name,
            detector,
            heuristics.policy(),
            WindowConfig::from_heuristics(heuristics),
            Instant::now(),
        )
    }

    /// A rollover callback already on `config` runs after the watermark is re-planned.
    pub fn with_window(
        name: impl Into<String>,
        detector: D,
        policy: SheddingPolicy,
        mut config: WindowConfig,
        start: Instant,
    ) -> Self {
        let name = name.into();
        let core = Arc::new(ShedderCore {
            name: name.clone(),
            watermark: Watermark::default(),
            policy,
            bucketing: config.bucketing,
            detector,
        });

        let planner = Arc::clone(&core);
        let chained = config.take_rollover();
        let config = config.with_rollover(Arc::new(move |now: Instant, retiring: &WindowState| {
            planner.adapt(now, retiring);
            if let Some(next) = &chained {
                next(now, retiring);
            }
        }));

        Self { window: TumblingWindow::new(name, config, start), core }
    }

    pub fn admit(&self, priority: Priority) -> bool {
        self.admit_at(priority, Instant::now())
    }

    pub fn admit_at(&self, priority: Priority, now: Instant) -> bool {
        let admitted = self.core.watermark.load().admit(priority);
        self.window.advance(priority, admitted, now);
        admitted
    }

    pub fn watermark(&self) -> AdmissionLevel {
        self.core.watermark.load()
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn detector(&self) -> &D {
        &self.core.detector
    }

    pub fn current_window(&self) -> Arc<WindowState> {
        self.window.current()
    }

    #[cfg(test)]
    pub(crate) fn adapt(&self, now: Instant, retiring: &WindowState) {
        self.core.adapt(now, retiring);
    }

    #[cfg(test)]
    pub(crate) fn force_watermark(&self, level: AdmissionLevel) {
        self.core.watermark.store(level);
    }
}

impl<D: OverloadDetector> ShedderCore<D> {
    fn adapt(&self, now: Instant, retiring: &WindowState) {
        if self.detector.is_overloaded(now, retiring) {
            self.drop_more(retiring);
        } else if self.detector.may_recover(now) {
            self.admit_more(retiring);
        } else {
            debug!(name = %self.name, watermark = %self.watermark.load(), "cooling off, hold watermark");
        }
    }

    fn drop_more(&self, retiring: &WindowState) {
        let admitted = retiring.admitted();
        let expected = (self.policy.drop_rate * admitted as f64) as u64;
        if expected == 0 {
            // too little admitted last window to plan a cut
            debug!(name = %self.name, admitted, "overloaded, nothing to drop");
            return;
        }

        let level = self.watermark.load();
        let histogram = retiring.histogram();
        let mut accumulated = 0u64;
        let mut head = None;
        for (&p, &n) in histogram.range(..=level.P()).rev() {
            accumulated += n;
            head = Some(p);
            debug!(name = %self.name, p, n, admitted, expected, accumulated, "drop plan");

            if accumulated >= expected {
                // exclude bucket p itself (its lowest key); exempt stays admitted
                let target = Priority::from_valid_p(p).higher();
                warn!(
                    name = %self.name, expected, accumulated, admitted,
                    "dropping more: {} -> {}", level, target
                );
                self.switch_to(target);
                return;
            }
        }

        match head {
            Some(p) => {
                warn!(name = %self.name, expected, accumulated, "histogram head reached, hold at P={}", p);
                self.switch_to(self.bucketing.ceiling(p));
            }
            None => debug!(name = %self.name, "no admitted traffic observed at or below watermark"),
        }
    }

    fn admit_more(&self, retiring: &WindowState) {
        let level = self.watermark.load();
        if level.is_admit_all() || retiring.requested() == 0 {
            return;
        }

        let admitted = retiring.admitted();
        if admitted == 0 {
            info!(name = %self.name, "healthy but everything shed: admit all");
            self.switch_to(Priority::lowest());
            return;
        }

        let expected = (self.policy.recover_rate * admitted as f64) as u64;
        let histogram = retiring.histogram();
        let mut accumulated = 0u64;
        for (&p, &n) in histogram.range(level.P() + 1..) {
            accumulated += n;
            debug!(name = %self.name, p, n, expected, accumulated, "admit plan");

            if accumulated >= expected {
                info!(
                    name = %self.name, expected, accumulated,
                    "admitting more: {} -> P={}", level, p
                );
                self.switch_to(self.bucketing.ceiling(p));
                return;
            }
        }

        info!(name = %self.name, expected, accumulated, "tail reached, admit all");
        self.switch_to(Priority::lowest());
    }

    fn switch_to(&self, breakwater: Priority) {
        let next = AdmissionLevel::new(breakwater);
        if next != self.watermark.load() {
            self.watermark.store(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Fixed {
        overloaded: AtomicBool,
        recover:    AtomicBool,
    }

    impl Fixed {
        fn new(overloaded: bool) -> Self {
            Self { overloaded: AtomicBool::new(overloaded), recover: AtomicBool::new(true) }
        }
    }

    impl OverloadDetector for Fixed {
        fn is_overloaded(&self, _now: Instant, _retiring: &WindowState) -> bool {
            self.overloaded.load(Ordering::Relaxed)
        }

        fn may_recover(&self, _now: Instant) -> bool {
            self.recover.load(Ordering::Relaxed)
        }
    }

    fn pr(b: i32, u: i32) -> Priority {
        Priority::of(b, u).unwrap()
    }

    fn shedder(
        overloaded: bool,
        drop_rate: f64,
        recover_rate: f64,
        count_cycle: u64,
    ) -> (WorkloadShedder<Fixed>, Instant) {
        let start = Instant::now();
        let s = WorkloadShedder::with_window(
            "test",
            Fixed::new(overloaded),
            SheddingPolicy { drop_rate, recover_rate },
            WindowConfig::new(Duration::from_secs(3600), count_cycle),
            start,
        );
        (s, start)
    }

    fn window(samples: &[(Priority, u64, bool)]) -> WindowState {
        let w = WindowState::new(Instant::now());
        for &(p, n, admitted) in samples {
            for _ in 0..n {
                w.sample(p, admitted);
            }
        }
        w
    }

    #[test]
    fn single_bucket_overload_excludes_it() {
        let (s, start) = shedder(true, 0.5, 0.1, 100);
        let bucket = pr(1, 100);
        for _ in 0..101 {
            assert!(s.admit_at(bucket, start));
        }

        // whole histogram consumed, so the only bucket itself goes
        let wm = s.watermark();
        assert!(wm.P() < bucket.P());
        assert_eq!(wm.breakwater(), pr(1, 99));
        assert!(!s.admit_at(bucket, start));
        assert!(s.admit_at(Priority::exempt(), start));
    }

    #[test]
    fn drop_more_stops_at_target_bucket() {
        let (s, _) = shedder(true, 0.5, 0.1, u64::MAX);
        // 100 admitted, 50 must go: (2,60) 30 + (1,44) 30 = 60
        let w = window(&[(pr(0, 100), 40, true), (pr(1, 44), 30, true), (pr(2, 60), 30, true)]);
        s.adapt(Instant::now(), &w);

        let wm = s.watermark();
        assert_eq!(wm.breakwater(), pr(1, 43));
        assert!(wm.admit(pr(0, 100)));
        assert!(!wm.admit(pr(1, 44)));
        assert!(wm.P() >= pr(0, 100).P(), "never below the lowest observed bucket");
    }

    #[test]
    fn drop_more_steps_below_a_b_boundary() {
        let (s, _) = shedder(true, 0.5, 0.1, u64::MAX);
        let w = window(&[(pr(0, 3), 10, true), (pr(4, 0), 10, true)]);
        s.adapt(Instant::now(), &w);
        assert_eq!(s.watermark().breakwater(), pr(3, 127));
    }

    #[test]
    fn drop_more_ignores_already_shed_buckets() {
        let (s, _) = shedder(true, 0.5, 0.1, u64::MAX);
        s.force_watermark(AdmissionLevel::new(pr(3, 0)));
        let w = window(&[(pr(0, 10), 10, true), (pr(2, 20), 10, true), (pr(19, 0), 500, false)]);
        s.adapt(Instant::now(), &w);
        // expected 10: the (2,20) bucket alone covers it
        assert_eq!(s.watermark().breakwater(), pr(2, 19));
    }

    #[test]
    fn drop_more_with_zero_target_is_noop() {
        let (s, _) = shedder(true, 0.05, 0.1, u64::MAX);
        let w = window(&[(pr(3, 50), 5, true)]);
        s.adapt(Instant::now(), &w);
        assert!(s.watermark().is_admit_all());

        let empty = WindowState::new(Instant::now());
        s.adapt(Instant::now(), &empty);
        assert!(s.watermark().is_admit_all());
    }

    #[test]
    fn drop_more_never_excludes_exempt() {
        let (s, _) = shedder(true, 1.0, 0.1, u64::MAX);
        let w = window(&[(Priority::exempt(), 10, true)]);
        s.adapt(Instant::now(), &w);
        assert_eq!(s.watermark().P(), 0);
        assert!(s.watermark().admit(Priority::exempt()));
    }

    #[test]
    fn drop_more_holds_at_head_when_short() {
        let (s, _) = shedder(true, 1.0, 0.1, u64::MAX);
        s.force_watermark(AdmissionLevel::new(pr(3, 0)));
        // counters say 10 admitted, the histogram at or below the watermark shows 4
        let w = window(&[(pr(1, 100), 4, true), (pr(125, 0), 6, true)]);
        s.adapt(Instant::now(), &w);
        assert_eq!(s.watermark().breakwater(), pr(1, 100));
    }

    #[test]
    fn recovery_opens_fully_when_everything_was_shed() {
        let (s, _) = shedder(false, 0.5, 1.0, u64::MAX);
        s.force_watermark(AdmissionLevel::new(pr(0, 10)));
        let w = window(&[(pr(1, 0), 20, false), (pr(2, 0), 20, false), (pr(35, 0), 5, false)]);
        s.adapt(Instant::now(), &w);
        assert!(s.watermark().is_admit_all());
    }

    #[test]
    fn recovery_opens_fully_when_tail_is_reached() {
        let (s, _) = shedder(false, 0.5, 1.0, u64::MAX);
        s.force_watermark(AdmissionLevel::new(pr(3, 0)));
        // 100 admitted, only 30 shed: a recovery budget of 100 cannot be filled
        let w = window(&[(pr(1, 0), 100, true), (pr(7, 0), 20, false), (pr(11, 0), 10, false)]);
        s.adapt(Instant::now(), &w);
        assert!(s.watermark().is_admit_all());
    }

    #[test]
    fn recovery_loosens_step_by_step() {
        let (s, _) = shedder(false, 0.5, 0.2, u64::MAX);
        s.force_watermark(AdmissionLevel::new(pr(3, 0)));
        // budget 20: (7,0) 15 then (11,0) 15
        let w = window(&[
            (pr(1, 0), 100, true),
            (pr(7, 0), 15, false),
            (pr(11, 0), 15, false),
            (pr(15, 0), 50, false),
        ]);
        s.adapt(Instant::now(), &w);
        assert_eq!(s.watermark().breakwater(), pr(11, 0));
    }

    #[test]
    fn recovery_at_admit_all_is_noop() {
        let (s, _) = shedder(false, 0.5, 1.0, u64::MAX);
        let w = window(&[(pr(1, 0), 10, true)]);
        s.adapt(Instant::now(), &w);
        assert!(s.watermark().is_admit_all());
    }

    #[test]
    fn cooling_off_holds_watermark() {
        let (s, _) = shedder(false, 0.5, 1.0, u64::MAX);
        s.detector().recover.store(false, Ordering::Relaxed);
        s.force_watermark(AdmissionLevel::new(pr(0, 10)));
        let w = window(&[(pr(1, 0), 20, false)]);
        s.adapt(Instant::now(), &w);
        assert_eq!(s.watermark().breakwater(), pr(0, 10));
    }

    #[test]
    fn overload_then_recovery_through_admit() {
        let (s, start) = shedder(true, 0.5, 1.0, 9);
        let (high, low) = (pr(0, 100), pr(78, 0));

        // window 1: 5 high + 5 low, overloaded
        for i in 0..10 {
            s.admit_at(if i % 2 == 0 { high } else { low }, start);
        }
        assert_eq!(s.watermark().breakwater(), pr(77, 127));

        // window 2: healthy again, 5 admitted so 5 may come back
        s.detector().overloaded.store(false, Ordering::Relaxed);
        for i in 0..10 {
            let admitted = s.admit_at(if i % 2 == 0 { high } else { low }, start);
            assert_eq!(admitted, i % 2 == 0);
        }
        assert_eq!(s.watermark().breakwater(), low);
        assert!(s.admit_at(low, start));
    }

    #[test]
    fn class_bucketing_moves_whole_b_classes() {
        let start = Instant::now();
        let s = WorkloadShedder::with_window(
            "mq",
            Fixed::new(true),
            SheddingPolicy { drop_rate: 0.5, recover_rate: 1.0 },
            WindowConfig::new(Duration::from_secs(3600), 9).with_bucketing(Bucketing::ByB),
            start,
        );
        let mixed = |i: i32| if i % 2 == 0 { pr(1, i * 12) } else { pr(2, i * 12) };

        for i in 0..10 {
            s.admit_at(mixed(i), start);
        }
        // all of class 2 goes, all of class 1 stays
        assert_eq!(s.watermark().breakwater(), pr(1, 127));
        assert!(!s.watermark().admit(pr(2, 0)));

        s.detector().overloaded.store(false, Ordering::Relaxed);
        for i in 0..10 {
            assert_eq!(s.admit_at(mixed(i), start), i % 2 == 0);
        }
        // class 2 comes back for every U, not just the key
        assert_eq!(s.watermark().breakwater(), pr(2, 127));
        assert!(s.admit_at(pr(2, 127), start));
    }

    #[test]
    fn concurrent_admits_keep_a_valid_watermark() {
        let (s, start) = shedder(true, 0.3, 0.1, 64);
        let s = Arc::new(s);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let s = s.clone();
                std::thread::spawn(move || {
                    for i in 0..2000 {
                        s.admit_at(pr((t * 7 + i) % 40, i % 128), start);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let wm = s.watermark();
        assert!(!wm.is_admit_all());
        assert!(Priority::from_p(wm.P() as i32).is_ok());
        assert!(s.admit_at(Priority::exempt(), start));
    }

    #[test]
    fn chained_rollover_still_runs() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let start = Instant::now();
        let cfg = WindowConfig::new(Duration::from_secs(3600), 1).with_rollover(Arc::new(
            move |_now: Instant, _w: &WindowState| flag.store(true, Ordering::Relaxed),
        ));
        let s = WorkloadShedder::with_window("chain", Fixed::new(false), SheddingPolicy::default(), cfg, start);
        s.admit_at(pr(0, 1), start);
        s.admit_at(pr(0, 1), start);
        assert!(fired.load(Ordering::Relaxed));
    }
}
