// breakwater/src/config.rs
//
// Numeric heuristics for the shedders.
//
// Sources, later wins:
//   1. compiled defaults
//   2. JSON document           Heuristics::from_json
//   3. BREAKWATER_* env vars   Heuristics::from_env / with_env_overrides
//
// A malformed env value is logged and ignored; the previous value stays.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

const ENV_PREFIX: &str = "BREAKWATER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heuristics {
    /// How long the CPU shedder refuses to loosen after an overload.
    pub cpu_overload_cool_off_secs: u64,
    /// Smoothed CPU usage above this is overload, in `[0, 1]`.
    pub cpu_usage_upper_bound: f64,
    /// EMA weight of the newest CPU sample.
    pub cpu_ema_alpha: f64,
    /// Period of the background CPU sampler.
    pub cpu_sample_interval_ms: u64,
    pub window_time_cycle_ms: u64,
    pub window_count_cycle: u64,
    /// Fraction of last window's admitted volume to shed when overloaded.
    pub drop_rate: f64,
    /// Fraction of last window's admitted volume to regain when healthy.
    pub recover_rate: f64,
    /// Average queued time per request above which a queue is overloaded.
    pub queued_avg_upper_bound_ms: u64,
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            cpu_overload_cool_off_secs: 10 * 60,
            cpu_usage_upper_bound:      0.75,
            cpu_ema_alpha:              0.25,
            cpu_sample_interval_ms:     250,
            window_time_cycle_ms:       1_000,
            window_count_cycle:         2 << 10, // 2K
            drop_rate:                  0.05,
            recover_rate:               0.015,
            queued_avg_upper_bound_ms:  200,
        }
    }
}

impl Heuristics {
    /// Defaults overlaid with `BREAKWATER_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let h: Self = serde_json::from_str(json)?;
        h.validate()?;
        Ok(h)
    }

    pub fn with_env_overrides(mut self) -> Self {
        override_from_env("CPU_OVERLOAD_COOL_OFF_SECS", &mut self.cpu_overload_cool_off_secs);
        override_from_env("CPU_USAGE_UPPER_BOUND", &mut self.cpu_usage_upper_bound);
        override_from_env("CPU_EMA_ALPHA", &mut self.cpu_ema_alpha);
        override_from_env("CPU_SAMPLE_INTERVAL_MS", &mut self.cpu_sample_interval_ms);
        override_from_env("WINDOW_TIME_CYCLE_MS", &mut self.window_time_cycle_ms);
        override_from_env("WINDOW_COUNT_CYCLE", &mut self.window_count_cycle);
        override_from_env("DROP_RATE", &mut self.drop_rate);
        override_from_env("RECOVER_RATE", &mut self.recover_rate);
        override_from_env("QUEUED_AVG_UPPER_BOUND_MS", &mut self.queued_avg_upper_bound_ms);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.cpu_usage_upper_bound) {
            return Err(invalid("cpu_usage_upper_bound", self.cpu_usage_upper_bound, "[0,1]"));
        }
        if !(self.cpu_ema_alpha > 0.0 && self.cpu_ema_alpha <= 1.0) {
            return Err(invalid("cpu_ema_alpha", self.cpu_ema_alpha, "(0,1]"));
        }
        if !(self.drop_rate > 0.0 && self.drop_rate <= 1.0) {
            return Err(invalid("drop_rate", self.drop_rate, "(0,1]"));
        }
        if !(self.recover_rate > 0.0 && self.recover_rate <= 1.0) {
            return Err(invalid("recover_rate", self.recover_rate, "(0,1]"));
        }
        if self.window_time_cycle_ms == 0 || self.window_count_cycle == 0 {
            return Err(Error::InvalidConfig("window cycles must be non-zero".into()));
        }
        if self.cpu_sample_interval_ms == 0 {
            return Err(Error::InvalidConfig("cpu_sample_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn cpu_overload_cool_off(&self) -> Duration {
        Duration::from_secs(self.cpu_overload_cool_off_secs)
    }

    pub fn cpu_sample_interval(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_interval_ms)
    }

    pub fn window_time_cycle(&self) -> Duration {
        Duration::from_millis(self.window_time_cycle_ms)
    }

    pub fn queued_avg_upper_bound(&self) -> Duration {
        Duration::from_millis(self.queued_avg_upper_bound_ms)
    }

    pub fn policy(&self) -> SheddingPolicy {
        SheddingPolicy { drop_rate: self.drop_rate, recover_rate: self.recover_rate }
    }
}

/// How far the watermark moves per window, as fractions of last window's
/// admitted volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SheddingPolicy {
    pub drop_rate:    f64,
    pub recover_rate: f64,
}

impl Default for SheddingPolicy {
    fn default() -> Self {
        Heuristics::default().policy()
    }
}

fn invalid(field: &str, value: f64, domain: &str) -> Error {
    Error::InvalidConfig(format!("{field}={value} not in {domain}"))
}

fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
    let var = format!("{ENV_PREFIX}{key}");
    let Ok(raw) = std::env::var(&var) else { return };
    match raw.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => warn!(var = %var, value = %raw, "ignoring malformed heuristic"),
    }
}
