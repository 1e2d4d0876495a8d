use libm::tanhf;
use ndarray::{Array, Array3, Dimension};

use crate::common::Linear;
use crate::config::GptConfig;
use crate::error::ModelError;
use crate::init::ParamInit;

/// GELU, tanh approximation.
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + tanhf((2.0f32 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x.powi(3))))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Gelu;

impl Gelu {
    pub fn forward<D: Dimension>(&self, x: &Array<f32, D>) -> Array<f32, D> {
        x.mapv(gelu_scalar)
    }
}

/// Position-wise feed-forward sublayer: `emb_dim -> 4 * emb_dim -> emb_dim`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    pub(crate) linear1: Linear,
    act: Gelu,
    pub(crate) linear2: Linear,
}

impl FeedForward {
    pub fn new(name: &str, config: &GptConfig, init: &mut dyn ParamInit) -> Result<Self, ModelError> {
        let hidden = config.ff_hidden_dim();
        let linear1 = Linear::new(&format!("{}.linear1", name), config.emb_dim, hidden, true, init)?;
        let linear2 = Linear::new(&format!("{}.linear2", name), hidden, config.emb_dim, true, init)?;
        Ok(Self { linear1, act: Gelu, linear2 })
    }

    pub fn num_params(&self) -> usize {
        self.linear1.num_params() + self.linear2.num_params()
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ModelError> {
        let h = self.linear1.forward(x)?;
        log::trace!("feed-forward expanded to {:?}", h.shape());
        let h = self.act.forward(&h);
        self.linear2.forward(&h)
    }
}
