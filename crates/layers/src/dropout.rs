//! Inverted dropout that is only active while the owning module trains.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use candle_core::{Error, Result, Tensor};

/// Dropout with a shared training flag.
pub struct Dropout {
    probability: f32,
    training: AtomicBool,
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        Self {
            probability: self.probability,
            training: AtomicBool::new(self.is_training()),
        }
    }
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .field("training", &self.is_training())
            .finish()
    }
}

impl Dropout {
    /// Creates a dropout layer in training mode; `probability` must lie in `[0, 1)`.
    pub fn new(probability: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Msg(format!(
                "dropout probability must lie in [0, 1), got {}",
                probability
            )));
        }
        Ok(Self {
            probability,
            training: AtomicBool::new(true),
        })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Enables or disables dropout.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    /// Zeroes activations with probability `p` and rescales survivors by `1 / (1 - p)`.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if !self.is_training() || self.probability == 0.0 {
            return Ok(input.clone());
        }
        candle_nn::ops::dropout(input, self.probability)
    }
}
