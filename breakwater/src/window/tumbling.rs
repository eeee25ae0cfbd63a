// breakwater/src/window/tumbling.rs
//
// Tumbling window engine.
//
//   Open ──sample──▶ Open ──full?──▶ Swapping ──▶ Open (fresh window)
//
// Completion is by elapsed time OR request count, whichever first (or count
// only, for message-queue style consumers). The swap is guarded by a single
// AtomicBool: one winner runs the rollover callback and installs a fresh
// window; losers return at once. Samples racing a swap may land in either
// window and are not replayed.
//
// Waits on the sample path, both short and swap-time only:
//   - `advance` takes the read side of the current-window RwLock; the swap
//     holds the write side just for the pointer store.
//   - the histogram snapshot walks DashMap shards, so a sampler adding a new
//     bucket key to a shard being read waits for that shard.
//
// Histogram keys come from `Bucketing`: exact P (default), or one bucket per
// B class for consumers that only rank by business class (message queues).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::Heuristics;
use crate::priority::{Priority, MAX_U};
use crate::window::state::WindowState;

/// Invoked by the swap winner with the retiring window, before it is dropped.
pub type RolloverCallback = Arc<dyn Fn(Instant, &WindowState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RolloverStrategy {
    /// Full after `time_cycle` or `count_cycle`, whichever first.
    #[default]
    TimeAndCount,
    /// Full after `count_cycle` only; idle time never closes a window.
    CountOnly,
}

/// How samples are grouped into histogram buckets. Keys are always valid P
/// values, so the control loop can walk them as priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bucketing {
    /// One bucket per P.
    #[default]
    ByP,
    /// One bucket per B, keyed by `(B, 0)`; U is ignored.
    ByB,
}

impl Bucketing {
    pub fn key(self, priority: Priority) -> u16 {
        match self {
            Bucketing::ByP => priority.P(),
            Bucketing::ByB => (priority.B() as u16) << 8,
        }
    }

    /// Loosest priority still inside the bucket `key`.
    pub(crate) fn ceiling(self, key: u16) -> Priority {
        match self {
            Bucketing::ByP => Priority::from_valid_p(key),
            Bucketing::ByB => Priority::from_valid_p((key & 0xff00) | MAX_U as u16),
        }
    }
}

#[derive(Clone)]
pub struct WindowConfig {
    pub time_cycle:  Duration,
    pub count_cycle: u64,
    pub strategy:    RolloverStrategy,
    pub bucketing:   Bucketing,
    on_rollover:     Option<RolloverCallback>,
}

impl WindowConfig {
    pub fn new(time_cycle: Duration, count_cycle: u64) -> Self {
        Self {
            time_cycle,
            count_cycle,
            strategy:    RolloverStrategy::default(),
            bucketing:   Bucketing::default(),
            on_rollover: None,
        }
    }

    pub fn with_bucketing(mut self, bucketing: Bucketing) -> Self {
        self.bucketing = bucketing;
        self
    }

    pub fn from_heuristics(h: &Heuristics) -> Self {
        Self::new(h.window_time_cycle(), h.window_count_cycle)
    }

    pub fn with_strategy(mut self, strategy: RolloverStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_rollover(mut self, callback: RolloverCallback) -> Self {
        self.on_rollover = Some(callback);
        self
    }

    pub(crate) fn take_rollover(&mut self) -> Option<RolloverCallback> {
        self.on_rollover.take()
    }

    pub fn full(&self, window: &WindowState, now: Instant) -> bool {
        let count_full = window.requested() > self.count_cycle;
        match self.strategy {
            RolloverStrategy::TimeAndCount => count_full || window.age(now) > self.time_cycle,
            RolloverStrategy::CountOnly => count_full,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self::from_heuristics(&Heuristics::default())
    }
}

impl std::fmt::Debug for WindowConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowConfig")
            .field("time_cycle", &self.time_cycle)
            .field("count_cycle", &self.count_cycle)
            .field("strategy", &self.strategy)
            .field("bucketing", &self.bucketing)
            .field("on_rollover", &self.on_rollover.is_some())
            .finish()
    }
}

pub struct TumblingWindow {
    name:     String,
    config:   WindowConfig,
    current:  RwLock<Arc<WindowState>>,
    swapping: AtomicBool,
}

impl TumblingWindow {
    pub fn new(name: impl Into<String>, config: WindowConfig, start: Instant) -> Self {
        Self {
            name:     name.into(),
            config,
            current:  RwLock::new(Arc::new(WindowState::new(start))),
            swapping: AtomicBool::new(false),
        }
    }

    /// The window samples currently land in.
    pub fn current(&self) -> Arc<WindowState> {
        Arc::clone(&*self.current.read())
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Record one sample; swap if that filled the window.
    /// Returns true when this call performed the swap.
    pub fn advance(&self, priority: Priority, admitted: bool, now: Instant) -> bool {
        let window = self.current();
        window.record(self.config.bucketing.key(priority), admitted);
        if !self.config.full(&window, now) {
            return false;
        }
        self.try_swap(now)
    }

    /// At most one concurrent swap; a loser returns false with no side effects.
    pub fn try_swap(&self, now: Instant) -> bool {
        if self
            .swapping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _guard = SwapGuard(&self.swapping);

        let retiring = self.current();
        // a previous winner may already have installed a fresh window
        if !self.config.full(&retiring, now) {
            return false;
        }

        trace!(name = %self.name, "swap window ...");
        if let Some(callback) = &self.config.on_rollover {
            callback(now, &retiring);
        }
        *self.current.write() = Arc::new(WindowState::new(now));

        debug!(
            name      = %self.name,
            age_ms    = retiring.age(now).as_millis() as u64,
            admitted  = retiring.admitted(),
            requested = retiring.requested(),
            delta     = retiring.requested() as i64 - self.config.count_cycle as i64,
            "swapped window"
        );
        true
    }
}

struct SwapGuard<'a>(&'a AtomicBool);

impl Drop for SwapGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
