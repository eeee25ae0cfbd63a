// breakwater/src/smoother.rs
//
// Value smoothers: turn a noisy raw metric (CPU usage) into a signal stable
// enough to drive a once-per-window control loop.
//
// Not internally synchronized. Callers own the writer side.

use std::collections::VecDeque;

use crate::error::{Error, Result};

pub trait ValueSmoother: Send {
    /// Feed a new raw value.
    fn update(&mut self, raw: f64) -> &mut Self
    where
        Self: Sized,
    {
        self.observe(raw);
        self
    }

    fn observe(&mut self, raw: f64);

    fn smoothed_value(&self) -> f64;
}

/// Exponential moving average, seeded with the first observation.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    smoothed: Option<f64>,
}

impl Ema {
    /// `alpha` is the weight of the newest sample, in `(0, 1]`.
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::InvalidConfig(format!("EMA alpha {alpha} not in (0,1]")));
        }
        Ok(Self { alpha, smoothed: None })
    }

    /// Like `new`, forcing `alpha` into `(0, 1]`; NaN becomes 1.
    pub(crate) fn clamped(alpha: f64) -> Self {
        let alpha = if alpha.is_nan() { 1.0 } else { alpha.clamp(f64::MIN_POSITIVE, 1.0) };
        Self { alpha, smoothed: None }
    }
}

impl ValueSmoother for Ema {
    fn observe(&mut self, raw: f64) {
        self.smoothed = Some(match self.smoothed {
            None => raw,
            Some(prev) => self.alpha * raw + (1.0 - self.alpha) * prev,
        });
    }

    fn smoothed_value(&self) -> f64 {
        self.smoothed.unwrap_or(0.0)
    }
}

/// Simple moving average over the last `window_size` observations.
#[derive(Debug, Clone)]
pub struct Sma {
    window_size: usize,
    values: VecDeque<f64>,
    sum: f64,
}

impl Sma {
    pub fn new(window_size: usize) -> Result<Self> {
        if window_size == 0 {
            return Err(Error::InvalidConfig("SMA window size must be >= 1".into()));
        }
        Ok(Self { window_size, values: VecDeque::with_capacity(window_size), sum: 0.0 })
    }
}

impl ValueSmoother for Sma {
    fn observe(&mut self, raw: f64) {
        if self.values.len() == self.window_size {
            if let Some(oldest) = self.values.pop_front() {
                self.sum -= oldest;
            }
        }
        self.values.push_back(raw);
        self.sum += raw;
    }

    fn smoothed_value(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.sum / self.values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn ema_seeds_with_first_value() {
        let mut ema = Ema::new(0.5).unwrap();
        assert_eq!(ema.smoothed_value(), 0.0);
        assert!(close(ema.update(0.8).smoothed_value(), 0.8));
        assert!(close(ema.update(0.4).smoothed_value(), 0.6));
        assert!(close(ema.update(0.6).smoothed_value(), 0.6));
    }

    #[test]
    fn ema_alpha_one_tracks_raw() {
        let mut ema = Ema::new(1.0).unwrap();
        ema.update(0.2).update(0.9);
        assert!(close(ema.smoothed_value(), 0.9));
    }

    #[test]
    fn ema_rejects_bad_alpha() {
        assert!(Ema::new(0.0).is_err());
        assert!(Ema::new(1.5).is_err());
        assert!(Ema::new(f64::NAN).is_err());
    }

    #[test]
    fn sma_evicts_oldest() {
        let mut sma = Sma::new(3).unwrap();
        sma.update(1.0).update(2.0);
        assert!(close(sma.smoothed_value(), 1.5));
        sma.update(3.0).update(10.0);
        assert!(close(sma.smoothed_value(), 5.0));
        assert!(Sma::new(0).is_err());
    }
}
