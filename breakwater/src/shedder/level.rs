// breakwater/src/shedder/level.rs
//
// Admission level (breakwater): the P threshold of one shedder.
//
//       P
//     ∧  ┌──┐
//     │  │  │ reject
//     │  │──┘
//   ───── breakwater
//     │  │  │
//     ∨  │  │ admit
//      0 └──┘
//
// Stricter (smaller P) sheds more; looser admits more. The value is
// immutable; a shedder publishes a new one through `Watermark`.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::priority::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLevel {
    breakwater: Priority,
}

impl AdmissionLevel {
    pub fn new(breakwater: Priority) -> Self {
        Self { breakwater }
    }

    /// Guards only the lowest priority, which means admitting everything.
    pub fn admit_all() -> Self {
        Self::new(Priority::lowest())
    }

    pub fn admit(&self, priority: Priority) -> bool {
        priority.P() <= self.P()
    }

    pub fn is_admit_all(&self) -> bool {
        self.P() == Priority::lowest().P()
    }

    #[allow(non_snake_case)]
    pub fn P(&self) -> u16 {
        self.breakwater.P()
    }

    pub fn breakwater(&self) -> Priority {
        self.breakwater
    }
}

impl fmt::Display for AdmissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AdmissionLevel(B={},U={};P={})",
            self.breakwater.B(),
            self.breakwater.U(),
            self.P()
        )
    }
}

/// Lock-free cell holding the current level as its P.
#[derive(Debug)]
pub struct Watermark(AtomicU32);

impl Watermark {
    pub fn new(level: AdmissionLevel) -> Self {
        Self(AtomicU32::new(level.P() as u32))
    }

    pub fn load(&self) -> AdmissionLevel {
        let p = self.0.load(Ordering::Acquire) as u16;
        AdmissionLevel::new(Priority::from_valid_p(p))
    }

    /// Returns the replaced level.
    pub fn store(&self, level: AdmissionLevel) -> AdmissionLevel {
        let prev = self.0.swap(level.P() as u32, Ordering::AcqRel) as u16;
        AdmissionLevel::new(Priority::from_valid_p(prev))
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new(AdmissionLevel::admit_all())
    }
}
