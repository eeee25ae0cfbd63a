// breakwater/src/main.rs
//
// breakwater-sim: drive one admission controller with synthetic prioritized
// traffic against a synthetic CPU, and print one line per second:
//
//   <timestamp> [sim] cpu:0.83 smooth:0.79 qps:1500.0 req:2000 shed:500 latency:35 exhausted:false
//
// Usage:
//   breakwater-sim                                   # steady 2000 qps vs capacity 1500
//   breakwater-sim --qps 800 --burst-qps 4000 --burst-at 20 --burst-secs 15
//   RUST_LOG=breakwater=debug breakwater-sim --duration 30

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Local;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use breakwater::{AdmissionController, CpuShedder, Feedback, FixedLoad, Heuristics, Priority, ShedCounters};

const TICK: Duration = Duration::from_millis(10);

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "breakwater-sim",
    about   = "Simulate priority-aware workload shedding",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, default_value = "2000", help = "Offered requests per second")]
    qps: u64,

    #[arg(long, default_value = "1500", help = "Admitted requests per second that pin the CPU at 100%")]
    capacity: u64,

    #[arg(long, default_value = "60", help = "Run time in seconds")]
    duration: u64,

    #[arg(long, default_value = "0", help = "Offered qps during the burst (0 = no burst)")]
    burst_qps: u64,

    #[arg(long, default_value = "20", help = "Burst start, seconds into the run")]
    burst_at: u64,

    #[arg(long, default_value = "10")]
    burst_secs: u64,

    #[arg(long, default_value = "20", help = "Business classes B drawn from [0, max_b]")]
    max_b: i32,

    #[arg(long, default_value = "5", help = "Base service latency in ms on an idle CPU")]
    base_latency_ms: u64,

    #[arg(long, default_value = "10", help = "CPU cool-off after overload, seconds")]
    cool_off_secs: u64,

    #[arg(long, default_value = "42")]
    seed: u64,
}

impl Cli {
    fn offered_qps(&self, second: u64) -> u64 {
        let bursting = self.burst_qps > 0
            && second >= self.burst_at
            && second < self.burst_at + self.burst_secs;
        if bursting { self.burst_qps } else { self.qps }
    }
}

// ── Synthetic system ─────────────────────────────────────────────────────────

struct Sim {
    controller: AdmissionController,
    cpu:        Arc<CpuShedder>,
    load:       Arc<FixedLoad>,
    counters:   Arc<ShedCounters>,
    latency_ms: AtomicU64,
}

impl Sim {
    fn new(cli: &Cli) -> Result<Self> {
        let h = Heuristics {
            cpu_overload_cool_off_secs: cli.cool_off_secs,
            ..Heuristics::from_env()
        };
        let load     = Arc::new(FixedLoad::new(0.0));
        let counters = Arc::new(ShedCounters::new());
        let cpu      = Arc::new(CpuShedder::cpu("sim-cpu", load.clone(), &h)?);
        let controller = AdmissionController::with_parts("sim", cpu.clone(), &h, counters.clone())?;
        info!(?h, "simulator heuristics");
        Ok(Self { controller, cpu, load, counters, latency_ms: AtomicU64::new(cli.base_latency_ms) })
    }

    fn offer(&self, rng: &mut StdRng, max_b: i32, n: u64) -> Result<()> {
        for _ in 0..n {
            let priority = Priority::of(rng.gen_range(0..=max_b), rng.gen_range(0..128))?;
            if self.controller.admit(&priority) {
                let delay = self.latency_ms.load(Ordering::Relaxed);
                self.controller.feedback(Feedback::queued(Duration::from_millis(delay)));
            }
        }
        Ok(())
    }

    /// Map last second's admitted volume onto CPU usage and latency.
    fn settle(&self, rng: &mut StdRng, admitted: u64, capacity: u64, base_latency_ms: u64) -> (f64, u64, bool) {
        let demand = admitted as f64 / capacity as f64;
        let noise  = rng.gen_range(-0.02..0.02);
        let usage  = (demand + noise).clamp(0.0, 1.0);
        let exhausted = demand >= 1.0;

        // M/M/1-ish: latency grows as 1/(1-u), plus backlog once saturated
        let util    = demand.min(0.95);
        let backlog = admitted.saturating_sub(capacity) * 1000 / capacity;
        let latency = (base_latency_ms as f64 / (1.0 - util)) as u64 + backlog;

        self.load.set(usage);
        // the simulator is the CPU sampler: one reading per simulated second
        self.cpu.detector().sample();
        self.latency_ms.store(latency, Ordering::Relaxed);
        (usage, latency, exhausted)
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("breakwater=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    if cli.capacity == 0 {
        bail!("--capacity must be positive");
    }
    if !(0..=127).contains(&cli.max_b) {
        bail!("--max-b must be in [0, 127]");
    }

    let sim   = Sim::new(&cli)?;
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let ticks_per_sec = (Duration::from_secs(1).as_millis() / TICK.as_millis()) as u64;

    let mut ticker = tokio::time::interval(TICK);
    let mut last   = sim.counters.stats();
    for second in 0..cli.duration {
        let offered = cli.offered_qps(second);
        for tick in 0..ticks_per_sec {
            ticker.tick().await;
            // spread the remainder over the first ticks
            let n = offered / ticks_per_sec + u64::from(tick < offered % ticks_per_sec);
            sim.offer(&mut rng, cli.max_b, n)?;
        }

        let now   = sim.counters.stats();
        let delta = now.since(&last);
        last = now;

        let (usage, latency, exhausted) =
            sim.settle(&mut rng, delta.admitted(), cli.capacity, cli.base_latency_ms);
        println!(
            "{} [sim] cpu:{:.4} smooth:{:.4} qps:{:.1} req:{} shed:{} latency:{} exhausted:{}",
            Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            usage,
            sim.cpu.smoothed_cpu_usage(),
            delta.admitted() as f64,
            delta.entered,
            delta.total_shed(),
            latency,
            exhausted,
        );
    }

    let total = sim.counters.stats();
    info!(
        entered = total.entered,
        shed_by_cpu = total.shed_by_cpu,
        shed_by_queue = total.shed_by_queue,
        shed_rate = total.shed_rate(),
        cpu_watermark = %sim.controller.cpu_watermark(),
        queue_watermark = %sim.controller.queue_watermark(),
        "simulation finished"
    );
    Ok(())
}
