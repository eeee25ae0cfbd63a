// breakwater/src/error.rs
//
// Library error type. Admission decisions themselves never fail; only
// construction of priorities and loading of heuristics can.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of range for B or U: B={b} U={u}")]
    InvalidPriority { b: i64, u: i64 },

    #[error("invalid P: {0}")]
    InvalidP(i64),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
