//! Learning-rate schedules.
//!
//! The schedule owns its step counter; the optimizer only ever sees the rate it is handed.

use crate::{Error, Result};

/// A per-batch learning-rate schedule.
pub trait LearningRateSchedule {
    /// Rate to use for the next optimizer step.
    fn current(&self) -> f64;

    /// Account for one finished optimizer step and return the rate for the next one.
    fn advance(&mut self) -> f64;
}

/// Linear decay over the nominal horizon of `n_pairs × epochs` samples.
///
/// `lr(step) = base_lr · (1 − step · batch_size / (n_pairs · epochs))`, with no floor: past the
/// horizon the rate turns negative. The counter is unset until the first [`advance`], which sets
/// it to 0 (so the second optimizer step still runs at `base_lr`), and grows by one per call
/// after that.
///
/// [`advance`]: LearningRateSchedule::advance
#[derive(Debug, Clone, PartialEq)]
pub struct LinearDecay {
    base_lr: f64,
    batch_size: usize,
    n_pairs: usize,
    epochs: usize,
    step: Option<u64>,
}

impl LinearDecay {
    pub fn new(base_lr: f64, batch_size: usize, n_pairs: usize, epochs: usize) -> Result<Self> {
        if !base_lr.is_finite() {
            return Err(Error::Domain("base_lr must be finite"));
        }
        if batch_size == 0 || n_pairs == 0 || epochs == 0 {
            return Err(Error::Domain("batch_size, n_pairs and epochs must be >= 1"));
        }
        Ok(Self {
            base_lr,
            batch_size,
            n_pairs,
            epochs,
            step: None,
        })
    }

    /// The rate formula at an explicit step.
    pub fn rate_at(&self, step: u64) -> f64 {
        let horizon = self.n_pairs as f64 * self.epochs as f64;
        self.base_lr * (1.0 - step as f64 * self.batch_size as f64 / horizon)
    }

    /// Current counter value (`None` before the first update).
    pub fn step(&self) -> Option<u64> {
        self.step
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }
}

impl LearningRateSchedule for LinearDecay {
    fn current(&self) -> f64 {
        match self.step {
            None => self.base_lr,
            Some(s) => self.rate_at(s),
        }
    }

    fn advance(&mut self) -> f64 {
        self.step = Some(match self.step {
            None => 0,
            Some(s) => s + 1,
        });
        self.current()
    }
}
