use ndarray::{s, Array2, Array3, Array4, Axis, Zip};
use rayon::prelude::*;

use crate::common::{softmax, Linear};
use crate::config::GptConfig;
use crate::dropout::{Dropout, ForwardContext};
use crate::error::ModelError;
use crate::init::ParamInit;

/// Runs `f` for every `(batch, head)` pair in parallel and returns results in
/// row-major `(batch, head)` order.
fn per_head<F>(batch_size: usize, n_heads: usize, f: F) -> Vec<Array2<f32>>
where
    F: Fn(usize, usize) -> Array2<f32> + Sync + Send,
{
    (0..batch_size * n_heads)
        .into_par_iter()
        .map(|i| f(i / n_heads, i % n_heads))
        .collect()
}

fn stack_heads(parts: Vec<Array2<f32>>, batch_size: usize, n_heads: usize) -> Array4<f32> {
    let (rows, cols) = parts.first().map_or((0, 0), |p| p.dim());
    let mut out = Array4::zeros((batch_size, n_heads, rows, cols));
    for (i, part) in parts.into_iter().enumerate() {
        out.slice_mut(s![i / n_heads, i % n_heads, .., ..]).assign(&part);
    }
    out
}

/// Causal multi-head self-attention.
///
/// Holds a `context_length x context_length` mask where `true` marks a key
/// position the query may not see (`j > i`).
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub(crate) n_heads: usize,
    pub(crate) emb_dim: usize,
    pub(crate) head_dim: usize,
    pub(crate) w_query: Linear,
    pub(crate) w_key: Linear,
    pub(crate) w_value: Linear,
    pub(crate) out_proj: Linear,
    dropout: Dropout,
    mask: Array2<bool>,
}

impl MultiHeadAttention {
    pub fn new(name: &str, config: &GptConfig, init: &mut dyn ParamInit) -> Result<Self, ModelError> {
        let n_heads = config.n_heads;
        let emb_dim = config.emb_dim;
        if n_heads == 0 || emb_dim == 0 {
            return Err(ModelError::config("n_heads", "n_heads and emb_dim must be positive"));
        }
        if emb_dim % n_heads != 0 {
            return Err(ModelError::config(
                "emb_dim",
                format!("emb_dim ({}) must be divisible by n_heads ({})", emb_dim, n_heads),
            ));
        }
        let ctx_len = config.context_length;

        Ok(Self {
            n_heads,
            emb_dim,
            head_dim: emb_dim / n_heads,
            w_query: Linear::new(&format!("{}.w_query", name), emb_dim, emb_dim, config.qkv_bias, init)?,
            w_key: Linear::new(&format!("{}.w_key", name), emb_dim, emb_dim, config.qkv_bias, init)?,
            w_value: Linear::new(&format!("{}.w_value", name), emb_dim, emb_dim, config.qkv_bias, init)?,
            out_proj: Linear::new(&format!("{}.out_proj", name), emb_dim, emb_dim, true, init)?,
            dropout: Dropout::new(config.drop_rate)?,
            mask: Array2::from_shape_fn((ctx_len, ctx_len), |(i, j)| j > i),
        })
    }

    pub fn num_params(&self) -> usize {
        self.w_query.num_params()
            + self.w_key.num_params()
            + self.w_value.num_params()
            + self.out_proj.num_params()
    }

    fn check_input(&self, x: &Array3<f32>) -> Result<(), ModelError> {
        let (_, seq_len, d_in) = x.dim();
        if d_in != self.emb_dim {
            return Err(ModelError::ShapeMismatch(format!(
                "Expected hidden states (batch, seq_len, {}), got shape: {:?}",
                self.emb_dim,
                x.shape()
            )));
        }
        if seq_len == 0 || x.dim().0 == 0 {
            return Err(ModelError::EmptyInput);
        }
        if seq_len > self.mask.nrows() {
            return Err(ModelError::SequenceTooLong { len: seq_len, context_length: self.mask.nrows() });
        }
        Ok(())
    }

    /// `[batch, seq, emb]` -> `[batch, heads, seq, head_dim]`.
    fn split_heads(&self, x: Array3<f32>) -> Result<Array4<f32>, ModelError> {
        let (batch_size, seq_len, _) = x.dim();
        let split = x
            .as_standard_layout()
            .into_owned()
            .into_shape((batch_size, seq_len, self.n_heads, self.head_dim))?;
        Ok(split.permuted_axes([0, 2, 1, 3]))
    }

    /// `[batch, heads, seq, head_dim]` -> `[batch, seq, emb]`, heads concatenated in order.
    fn merge_heads(&self, x: Array4<f32>) -> Result<Array3<f32>, ModelError> {
        let (batch_size, _, seq_len, _) = x.dim();
        let merged = x
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape((batch_size, seq_len, self.emb_dim))?;
        Ok(merged)
    }

    /// Masked, scaled softmax of `q @ k^T` per head.
    fn weights_from(&self, queries: &Array4<f32>, keys: &Array4<f32>) -> Array4<f32> {
        let (batch_size, _, seq_len, _) = queries.dim();
        let mask = self.mask.slice(s![..seq_len, ..seq_len]);
        let scale = 1.0 / (self.head_dim as f32).sqrt();

        let parts = per_head(batch_size, self.n_heads, |b, h| {
            let q = queries.slice(s![b, h, .., ..]);
            let k = keys.slice(s![b, h, .., ..]);
            let mut scores = q.dot(&k.t());
            Zip::from(&mut scores).and(&mask).for_each(|score, &masked| {
                if masked {
                    *score = f32::NEG_INFINITY;
                }
            });
            scores.mapv_inplace(|v| v * scale);
            softmax(&scores, Axis(1))
        });
        stack_heads(parts, batch_size, self.n_heads)
    }

    fn project(&self, x: &Array3<f32>) -> Result<(Array4<f32>, Array4<f32>, Array4<f32>), ModelError> {
        let queries = self.split_heads(self.w_query.forward(x)?)?;
        let keys = self.split_heads(self.w_key.forward(x)?)?;
        let values = self.split_heads(self.w_value.forward(x)?)?;
        log::trace!(
            "attention q/k/v split into {} heads: {:?}",
            self.n_heads,
            queries.shape()
        );
        Ok((queries, keys, values))
    }

    /// Attention probabilities `[batch, heads, seq, seq]` before dropout.
    pub fn attention_weights(&self, x: &Array3<f32>) -> Result<Array4<f32>, ModelError> {
        self.check_input(x)?;
        let (queries, keys, _) = self.project(x)?;
        Ok(self.weights_from(&queries, &keys))
    }

    pub fn forward(&self, x: &Array3<f32>, ctx: &mut ForwardContext) -> Result<Array3<f32>, ModelError> {
        self.check_input(x)?;
        let (queries, keys, values) = self.project(x)?;

        let weights = self.weights_from(&queries, &keys);
        log::trace!("attention weights {:?}", weights.shape());
        let weights = self.dropout.forward(weights, ctx);

        let (batch_size, n_heads, _, _) = weights.dim();
        let context = per_head(batch_size, n_heads, |b, h| {
            weights.slice(s![b, h, .., ..]).dot(&values.slice(s![b, h, .., ..]))
        });
        let context = self.merge_heads(stack_heads(context, batch_size, n_heads))?;

        self.out_proj.forward(&context)
    }
}
