// Controller facade over injected shedders: two-stage gate, feedback routing,
// observability hooks and recovery.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use breakwater::{
    AdmissionController, CpuShedder, Feedback, FixedLoad, Heuristics, Priority, ShedCounters, Workload,
};

fn heuristics() -> Heuristics {
    Heuristics {
        cpu_ema_alpha: 1.0,
        cpu_overload_cool_off_secs: 5,
        window_count_cycle: 99,
        window_time_cycle_ms: 3_600_000,
        drop_rate: 0.2,
        recover_rate: 0.5,
        queued_avg_upper_bound_ms: 50,
        ..Heuristics::default()
    }
}

struct Setup {
    controller: AdmissionController,
    load:       Arc<FixedLoad>,
    counters:   Arc<ShedCounters>,
}

fn setup(usage: f64) -> Setup {
    let h = heuristics();
    let load = Arc::new(FixedLoad::new(usage));
    let cpu = Arc::new(CpuShedder::cpu("cpu", load.clone(), &h).unwrap());
    // stands in for the background sampler
    cpu.detector().sample();
    let counters = Arc::new(ShedCounters::new());
    let controller = AdmissionController::with_parts("checkout", cpu, &h, counters.clone()).unwrap();
    Setup { controller, load, counters }
}

/// 100 requests, B spread over 0..10, all at `now`.
fn round(c: &AdmissionController, now: Instant) -> usize {
    (0..100)
        .filter(|i| c.admit_at(Priority::of(i % 10, 0).unwrap(), now))
        .count()
}

struct Request {
    tenant: i32,
}

impl Workload for Request {
    fn priority(&self) -> Priority {
        Priority::of_hourly_random_u_at(self.tenant, 0xBEEF, 0)
    }
}

#[test]
fn workload_trait_objects_are_admitted() {
    let s = setup(0.1);
    let req = Request { tenant: 3 };
    assert!(s.controller.admit(&req));
    let dynamic: &dyn Workload = &req;
    assert!(s.controller.admit(dynamic));
    assert_eq!(s.counters.stats().entered, 2);
}

#[test]
fn sustained_cpu_overload_tightens_step_by_step() {
    let s = setup(0.95);
    let t0 = Instant::now();
    let mut previous = u16::MAX;
    for i in 0..4u64 {
        round(&s.controller, t0 + Duration::from_millis(i));
        let p = s.controller.cpu_watermark().P();
        assert!(p <= previous, "watermark only tightens while overloaded");
        previous = p;
    }
    assert!(!s.controller.cpu_watermark().is_admit_all());
    assert!(s.counters.stats().shed_by_cpu > 0);
    assert_eq!(s.counters.stats().shed_by_queue, 0);
}

#[test]
fn cpu_recovers_after_cool_off() {
    let s = setup(0.95);
    let t0 = Instant::now();
    round(&s.controller, t0);
    round(&s.controller, t0);
    let tightened = s.controller.cpu_watermark();
    assert!(!tightened.is_admit_all());

    s.load.set(0.2);
    s.controller.cpu_shedder().detector().sample();
    round(&s.controller, t0 + Duration::from_secs(1));
    assert_eq!(s.controller.cpu_watermark(), tightened, "held while cooling off");

    for i in 0..10u64 {
        round(&s.controller, t0 + Duration::from_secs(10 + i));
    }
    assert!(s.controller.cpu_watermark().is_admit_all());
    assert_eq!(round(&s.controller, t0 + Duration::from_secs(30)), 100);
}

#[test]
fn queueing_feedback_only_moves_the_queue_watermark() {
    let s = setup(0.1);
    let t0 = Instant::now();
    for _ in 0..100 {
        s.controller.feedback(Feedback::queued(Duration::from_millis(400)));
    }
    round(&s.controller, t0);

    assert!(s.controller.cpu_watermark().is_admit_all());
    assert!(!s.controller.queue_watermark().is_admit_all());

    round(&s.controller, t0);
    let stats = s.counters.stats();
    assert!(stats.shed_by_queue > 0);
    assert_eq!(stats.shed_by_cpu, 0);
}

#[test]
fn queue_recovers_once_delays_drop() {
    let s = setup(0.1);
    let t0 = Instant::now();
    s.controller.feedback(Feedback::overload(t0));
    round(&s.controller, t0);
    assert!(!s.controller.queue_watermark().is_admit_all());

    // windows opened after the overload instant see no overload
    for i in 1..20u64 {
        round(&s.controller, t0 + Duration::from_millis(i));
    }
    assert!(s.controller.queue_watermark().is_admit_all());
}

#[test]
fn exempt_survives_everything() {
    let s = setup(1.0);
    let t0 = Instant::now();
    s.controller.feedback(Feedback::overload(t0 + Duration::from_secs(3600)));
    for i in 0..1000u64 {
        let now = t0 + Duration::from_millis(i);
        assert!(s.controller.admit_at(Priority::exempt(), now));
        s.controller.admit_at(Priority::of(9, 9).unwrap(), now);
    }
    assert!(s.counters.stats().total_shed() > 0);
}

#[test]
fn concurrent_admission_is_consistent() {
    let s = Arc::new(setup(0.9));
    let t0 = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let s = s.clone();
            thread::spawn(move || {
                let mut admitted = 0u64;
                for i in 0..5_000 {
                    if s.controller.admit_at(Priority::of((t + i) % 30, i % 128).unwrap(), t0) {
                        admitted += 1;
                    }
                    s.controller.feedback(Feedback::queued(Duration::from_millis(1)));
                }
                admitted
            })
        })
        .collect();
    let admitted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let stats = s.counters.stats();
    assert_eq!(stats.entered, 40_000);
    assert_eq!(stats.admitted(), admitted);
    assert!(stats.shed_by_cpu > 0);
}
