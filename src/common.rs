use ndarray::{Array, Array1, Array2, Array3, ArrayView2, Axis, Dimension, Ix1, Ix2, Zip};

use crate::error::ModelError;
use crate::init::{request, ParamInit};

/// Per-token feature normalization: `scale * (x - mean) / sqrt(var + eps) + shift`.
///
/// The variance is the population variance over the last axis.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub(crate) scale: Array1<f32>,
    pub(crate) shift: Array1<f32>,
    epsilon: f32,
}

impl LayerNorm {
    pub const EPSILON: f32 = 1e-8;

    pub fn new(name: &str, emb_dim: usize, init: &mut dyn ParamInit) -> Result<Self, ModelError> {
        if emb_dim == 0 {
            return Err(ModelError::config("emb_dim", "LayerNorm width must be positive"));
        }
        let scale = request(init, &format!("{}.scale", name), &[emb_dim])?.into_dimensionality::<Ix1>()?;
        let shift = request(init, &format!("{}.shift", name), &[emb_dim])?.into_dimensionality::<Ix1>()?;
        Ok(Self { scale, shift, epsilon: Self::EPSILON })
    }

    pub fn dim(&self) -> usize {
        self.scale.len()
    }

    pub fn forward<D: Dimension>(&self, x: &Array<f32, D>) -> Result<Array<f32, D>, ModelError> {
        let last = x
            .ndim()
            .checked_sub(1)
            .ok_or_else(|| ModelError::ShapeMismatch("LayerNorm input has no dimensions".into()))?;
        if x.shape()[last] != self.dim() {
            return Err(ModelError::ShapeMismatch(format!(
                "LayerNorm expects last dimension {}, got shape {:?}",
                self.dim(),
                x.shape()
            )));
        }

        let n = self.dim() as f32;
        let mut out = x.to_owned();
        for mut lane in out.lanes_mut(Axis(last)) {
            let mean = lane.sum() / n;
            let variance = lane.fold(0.0f32, |acc, &v| acc + (v - mean) * (v - mean)) / n;
            let inv_std = 1.0 / (variance + self.epsilon).sqrt();
            Zip::from(&mut lane)
                .and(&self.scale)
                .and(&self.shift)
                .for_each(|v, &g, &b| *v = g * ((*v - mean) * inv_std) + b);
        }
        Ok(out)
    }
}

/// Affine projection `x @ W + b` with `W` laid out `[in_features, out_features]`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub(crate) weight: Array2<f32>,
    pub(crate) bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new(
        name: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
        init: &mut dyn ParamInit,
    ) -> Result<Self, ModelError> {
        let weight = request(init, &format!("{}.weight", name), &[in_features, out_features])?
            .into_dimensionality::<Ix2>()?;
        let bias = if bias {
            Some(request(init, &format!("{}.bias", name), &[out_features])?.into_dimensionality::<Ix1>()?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn num_params(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    /// Projects `[batch, seq, in]` to `[batch, seq, out]`.
    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ModelError> {
        let (batch_size, seq_len, d_in) = x.dim();
        if d_in != self.in_features() {
            return Err(ModelError::ShapeMismatch(format!(
                "Linear expects {} input features, got shape {:?}",
                self.in_features(),
                x.shape()
            )));
        }
        let x_2d = x
            .as_standard_layout()
            .into_owned()
            .into_shape((batch_size * seq_len, d_in))?;
        let projected = self.forward_2d(x_2d.view());
        Ok(projected.into_shape((batch_size, seq_len, self.out_features()))?)
    }

    pub(crate) fn forward_2d(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let out = x.dot(&self.weight);
        match &self.bias {
            Some(b) => out + b,
            None => out,
        }
    }
}

/// Row lookup table, `[num_embeddings, emb_dim]`.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub(crate) weight: Array2<f32>,
}

impl Embedding {
    pub fn new(
        name: &str,
        num_embeddings: usize,
        emb_dim: usize,
        init: &mut dyn ParamInit,
    ) -> Result<Self, ModelError> {
        let weight = request(init, &format!("{}.weight", name), &[num_embeddings, emb_dim])?
            .into_dimensionality::<Ix2>()?;
        Ok(Self { weight })
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.nrows()
    }

    pub fn emb_dim(&self) -> usize {
        self.weight.ncols()
    }

    /// Gathers rows for a `[batch, seq]` index grid. Indices must already be in range.
    pub fn lookup(&self, ids: &Array2<usize>) -> Array3<f32> {
        let (batch_size, seq_len) = ids.dim();
        let mut out = Array3::zeros((batch_size, seq_len, self.emb_dim()));
        Zip::from(out.lanes_mut(Axis(2)))
            .and(ids)
            .for_each(|mut row, &id| row.assign(&self.weight.row(id)));
        out
    }
}

/// Softmax over `axis`, max-subtracted so `-inf` entries come out as exact zeros.
pub fn softmax<D: Dimension>(input: &Array<f32, D>, axis: Axis) -> Array<f32, D> {
    let mut out = input.to_owned();
    for mut lane in out.lanes_mut(axis) {
        let max_val = lane.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        lane.mapv_inplace(|v| (v - max_val).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}
