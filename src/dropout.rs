//! Dropout and the per-call context that owns its randomness.
//!
//! A forward pass never touches global randomness. Callers hand in a
//! [`ForwardContext`]; in inference mode dropout is the identity, in training
//! mode it draws from the seeded generator the context carries.

use ndarray::{Array, Dimension};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ModelError;

/// What to do when an intermediate tensor holds NaN or infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericPolicy {
    Ignore,
    #[default]
    Warn,
    Strict,
}

#[derive(Debug)]
pub struct ForwardContext {
    rng: Option<StdRng>,
    policy: NumericPolicy,
}

impl ForwardContext {
    pub fn inference() -> Self {
        Self { rng: None, policy: NumericPolicy::default() }
    }

    pub fn training(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng: Some(rng), policy: NumericPolicy::default() }
    }

    pub fn numeric_policy(mut self, policy: NumericPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_training(&self) -> bool {
        self.rng.is_some()
    }

    pub fn policy(&self) -> NumericPolicy {
        self.policy
    }

    /// Applies the numeric policy to `tensor`, naming `stage` in the report.
    pub fn check_finite<D: Dimension>(
        &self,
        stage: &str,
        tensor: &Array<f32, D>,
    ) -> Result<(), ModelError> {
        if self.policy == NumericPolicy::Ignore {
            return Ok(());
        }
        let bad = tensor.iter().filter(|v| !v.is_finite()).count();
        if bad == 0 {
            return Ok(());
        }
        match self.policy {
            NumericPolicy::Strict => Err(ModelError::NonFinite { stage: stage.to_string() }),
            _ => {
                log::warn!("{}: {} non-finite values out of {}", stage, bad, tensor.len());
                Ok(())
            }
        }
    }
}

impl Default for ForwardContext {
    fn default() -> Self {
        Self::inference()
    }
}

/// Inverted dropout: survivors are scaled by `1 / (1 - rate)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Result<Self, ModelError> {
        if !(0.0..1.0).contains(&rate) {
            return Err(ModelError::config(
                "drop_rate",
                format!("dropout rate ({}) must lie in [0, 1)", rate),
            ));
        }
        Ok(Self { rate })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn forward<D: Dimension>(&self, x: Array<f32, D>, ctx: &mut ForwardContext) -> Array<f32, D> {
        let rng = match ctx.rng.as_mut() {
            Some(rng) if self.rate > 0.0 => rng,
            _ => return x,
        };
        let keep = 1.0 - self.rate;
        let scale = 1.0 / keep;
        let mut out = x;
        // Sequential over the buffer so a given seed always yields the same mask.
        out.iter_mut().for_each(|v| {
            if rng.gen::<f32>() < keep {
                *v *= scale;
            } else {
                *v = 0.0;
            }
        });
        out
    }
}
