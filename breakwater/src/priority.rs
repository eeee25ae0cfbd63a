// breakwater/src/priority.rs
//
// Workload priority: the value carried with every unit of work and propagated
// from caller to callee.
//
//   B  business rank, coarse, assigned by the caller (lower = more important)
//   U  sub-rank inside a B class, assigned or derived per hour
//   P  = B * 256 + U, the only value compared against the watermark
//
//   │<────────────────────── high priority ─────────────────────────────
//   │<───── B=0 ─────>│<──────────────── B=3 ────────────────>│<─ B=8 ─>
//   +─────────────────+───────────────────────────────────────+─────────
//   │ 0 │ 5 │ 8 │ 127 │ 1 │ 2 │ 7 │ 12 │ 50 │ 101 │ 102 │ 115 │ ......
//   +─────────────────+───────────────────────────────────────+─────────
//
// Only B and U go on the wire: {"B":3,"U":50}.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_B: u8 = 127;
pub const MAX_U: u8 = 127;

const B_SHIFT: u32 = 8;
const MAX_P: u16 = ((MAX_B as u16) << B_SHIFT) | MAX_U as u16; // 32639
const SECS_PER_HOUR: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WirePriority")]
pub struct Priority {
    #[serde(rename = "B")]
    b: u8,
    #[serde(rename = "U")]
    u: u8,
}

/// Unvalidated wire shape; every decoded priority goes through `Priority::of`.
#[derive(Deserialize)]
struct WirePriority {
    #[serde(rename = "B")]
    b: i32,
    #[serde(rename = "U")]
    u: i32,
}

impl TryFrom<WirePriority> for Priority {
    type Error = Error;

    fn try_from(wire: WirePriority) -> Result<Self> {
        Priority::of(wire.b, wire.u)
    }
}

impl Priority {
    /// Build a priority from its B and U ranks, both in `[0,127]`.
    pub fn of(b: i32, u: i32) -> Result<Self> {
        if !(0..=MAX_B as i32).contains(&b) || !(0..=MAX_U as i32).contains(&u) {
            return Err(Error::InvalidPriority { b: b as i64, u: u as i64 });
        }
        Ok(Self { b: b as u8, u: u as u8 })
    }

    /// Inverse of [`Priority::P`].
    pub fn from_p(p: i32) -> Result<Self> {
        if !(0..=MAX_P as i32).contains(&p) {
            return Err(Error::InvalidP(p as i64));
        }
        let b = p >> B_SHIFT;
        let u = p & 0xff;
        if u > MAX_U as i32 {
            // e.g. 128..=255 in the low byte: no (B,U) maps there
            return Err(Error::InvalidP(p as i64));
        }
        Ok(Self { b: b as u8, u: u as u8 })
    }

    /// Caller guarantees `p` was produced by [`Priority::P`].
    pub(crate) const fn from_valid_p(p: u16) -> Self {
        Self { b: (p >> B_SHIFT) as u8, u: (p & 0xff) as u8 }
    }

    /// Lowest possible priority; as a watermark it admits everything.
    pub const fn lowest() -> Self {
        Self { b: MAX_B, u: MAX_U }
    }

    /// Reserved for health checks and control traffic. Never shed.
    pub const fn exempt() -> Self {
        Self { b: 0, u: 0 }
    }

    /// B from `group_seed`, U derived from `identifier_hash` and the current
    /// wall-clock hour, so one identifier keeps its U for the whole hour.
    pub fn of_hourly_random_u(group_seed: i32, identifier_hash: i32) -> Self {
        let hour_bucket = Utc::now().timestamp().div_euclid(SECS_PER_HOUR);
        Self::of_hourly_random_u_at(group_seed, identifier_hash, hour_bucket)
    }

    pub fn of_hourly_random_u_at(group_seed: i32, identifier_hash: i32, hour_bucket: i64) -> Self {
        let b = fold(group_seed as i64);
        let seed = ((identifier_hash as u32 as u64) << 32) | (hour_bucket as u64 & 0xffff_ffff);
        let u = (mix64(seed) % (MAX_U as u64 + 1)) as u8;
        Self { b, u }
    }

    #[allow(non_snake_case)]
    pub fn B(&self) -> u8 {
        self.b
    }

    #[allow(non_snake_case)]
    pub fn U(&self) -> u8 {
        self.u
    }

    /// Normalized rank; lower is more important.
    #[allow(non_snake_case)]
    pub fn P(&self) -> u16 {
        ((self.b as u16) << B_SHIFT) | self.u as u16
    }

    /// P read as seconds of tolerable queueing: `lowest()` tolerates ~9 hours.
    pub fn delay_tolerance(&self) -> Duration {
        Duration::from_secs(self.P() as u64)
    }

    /// The next more important priority (P one step down, skipping the
    /// unused U range 128..=255). Exempt has none and returns itself.
    pub fn higher(&self) -> Self {
        match (self.b, self.u) {
            (0, 0) => *self,
            (b, 0) => Self { b: b - 1, u: MAX_U },
            (b, u) => Self { b, u: u - 1 },
        }
    }

    /// Short `B,U` form used in log lines.
    pub fn simple_string(&self) -> String {
        format!("{},{}", self.b, self.u)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.P().cmp(&other.P())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priority(B={},U={};P={})", self.b, self.u, self.P())
    }
}

/// Anything admission control can rank: RPC calls, MQ messages, queued tasks.
pub trait Workload {
    fn priority(&self) -> Priority;
}

impl Workload for Priority {
    fn priority(&self) -> Priority {
        *self
    }
}

fn fold(v: i64) -> u8 {
    v.rem_euclid(MAX_B as i64 + 1) as u8
}

// splitmix64 finalizer
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
