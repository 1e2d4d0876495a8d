//! Parameter sources.
//!
//! Layers only know their parameter shapes; values come from a [`ParamInit`].
//! Each tensor is requested under a dotted name such as
//! `blocks.0.att.w_query.weight`, so a loaded weight map and a random
//! initializer plug into the same constructors.

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;

use crate::error::ModelError;

pub trait ParamInit {
    fn init(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, ModelError>;
}

/// LayerNorm parameters start at identity regardless of the initializer.
fn norm_default(name: &str, shape: &[usize]) -> Option<ArrayD<f32>> {
    if name.ends_with(".scale") {
        Some(ArrayD::ones(IxDyn(shape)))
    } else if name.ends_with(".shift") {
        Some(ArrayD::zeros(IxDyn(shape)))
    } else {
        None
    }
}

/// Fills every weight and bias with one value.
#[derive(Debug, Clone, Copy)]
pub struct ConstantInit(pub f32);

impl ParamInit for ConstantInit {
    fn init(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, ModelError> {
        Ok(norm_default(name, shape).unwrap_or_else(|| ArrayD::from_elem(IxDyn(shape), self.0)))
    }
}

/// Seeded N(0, std) weights with zero biases.
#[derive(Debug)]
pub struct NormalInit {
    rng: StdRng,
    dist: Normal<f32>,
}

impl NormalInit {
    pub fn new(seed: u64, std: f32) -> Result<Self, ModelError> {
        let dist = Normal::new(0.0, std)
            .map_err(|e| ModelError::config("init_std", format!("{}", e)))?;
        Ok(Self { rng: StdRng::seed_from_u64(seed), dist })
    }

    /// GPT-2's 0.02 standard deviation.
    pub fn gpt2(seed: u64) -> Result<Self, ModelError> {
        Self::new(seed, 0.02)
    }
}

impl ParamInit for NormalInit {
    fn init(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, ModelError> {
        if let Some(norm) = norm_default(name, shape) {
            return Ok(norm);
        }
        if name.ends_with(".bias") {
            return Ok(ArrayD::zeros(IxDyn(shape)));
        }
        let rng = &mut self.rng;
        let dist = &self.dist;
        Ok(ArrayD::from_shape_simple_fn(IxDyn(shape), || dist.sample(rng)))
    }
}

/// A weight map produced by some external loader.
impl ParamInit for HashMap<String, ArrayD<f32>> {
    fn init(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, ModelError> {
        let tensor = self
            .remove(name)
            .ok_or_else(|| ModelError::WeightNotFound(name.to_string()))?;
        if tensor.shape() != shape {
            return Err(ModelError::ShapeMismatch(format!(
                "Weight {} has shape {:?}, expected {:?}",
                name,
                tensor.shape(),
                shape
            )));
        }
        Ok(tensor)
    }
}

/// Requests a parameter and checks the returned shape.
pub(crate) fn request(
    init: &mut dyn ParamInit,
    name: &str,
    shape: &[usize],
) -> Result<ArrayD<f32>, ModelError> {
    let tensor = init.init(name, shape)?;
    if tensor.shape() != shape {
        return Err(ModelError::ShapeMismatch(format!(
            "Initializer returned {:?} for {}, expected {:?}",
            tensor.shape(),
            name,
            shape
        )));
    }
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_init_keeps_norm_identity() {
        let mut init = ConstantInit(0.5);
        let w = init.init("blocks.0.ff.linear1.weight", &[2, 3]).unwrap();
        assert!(w.iter().all(|&v| v == 0.5));
        let scale = init.init("final_norm.scale", &[3]).unwrap();
        assert!(scale.iter().all(|&v| v == 1.0));
        let shift = init.init("final_norm.shift", &[3]).unwrap();
        assert!(shift.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_normal_init_is_seeded() {
        let a = NormalInit::gpt2(3).unwrap().init("tok_emb.weight", &[4, 4]).unwrap();
        let b = NormalInit::gpt2(3).unwrap().init("tok_emb.weight", &[4, 4]).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().any(|&v| v != 0.0));
        let bias = NormalInit::gpt2(3).unwrap().init("out_proj.bias", &[4]).unwrap();
        assert!(bias.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_map_init_missing_and_wrong_shape() {
        let mut weights: HashMap<String, ArrayD<f32>> = HashMap::new();
        weights.insert("a".to_string(), ArrayD::zeros(IxDyn(&[2, 2])));
        assert!(matches!(weights.init("b", &[2, 2]), Err(ModelError::WeightNotFound(_))));
        assert!(matches!(weights.init("a", &[3, 2]), Err(ModelError::ShapeMismatch(_))));
    }

    #[test]
    fn test_request_checks_shape() {
        struct Wrong;
        impl ParamInit for Wrong {
            fn init(&mut self, _: &str, _: &[usize]) -> Result<ArrayD<f32>, ModelError> {
                Ok(ArrayD::zeros(IxDyn(&[1])))
            }
        }
        assert!(request(&mut Wrong, "x.weight", &[2, 2]).is_err());
    }
}
