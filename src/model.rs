use ndarray::{s, Array2, Array3, Axis};
use ndarray_stats::QuantileExt;

use crate::attention::MultiHeadAttention;
use crate::common::{Embedding, LayerNorm, Linear};
use crate::config::GptConfig;
use crate::dropout::{Dropout, ForwardContext};
use crate::error::ModelError;
use crate::init::ParamInit;
use crate::mlp::FeedForward;

/// Pre-norm transformer block:
///
/// ```text
/// x'  = x  + Dropout(Attention(LayerNorm1(x)))
/// x'' = x' + Dropout(FeedForward(LayerNorm2(x')))
/// ```
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    pub(crate) att: MultiHeadAttention,
    pub(crate) ff: FeedForward,
    pub(crate) norm1: LayerNorm,
    pub(crate) norm2: LayerNorm,
    drop_shortcut: Dropout,
}

impl TransformerBlock {
    pub fn new(index: usize, config: &GptConfig, init: &mut dyn ParamInit) -> Result<Self, ModelError> {
        let name = format!("blocks.{}", index);
        Ok(Self {
            att: MultiHeadAttention::new(&format!("{}.att", name), config, init)?,
            ff: FeedForward::new(&format!("{}.ff", name), config, init)?,
            norm1: LayerNorm::new(&format!("{}.norm1", name), config.emb_dim, init)?,
            norm2: LayerNorm::new(&format!("{}.norm2", name), config.emb_dim, init)?,
            drop_shortcut: Dropout::new(config.drop_rate)?,
        })
    }

    pub fn attention(&self) -> &MultiHeadAttention {
        &self.att
    }

    pub fn num_params(&self) -> usize {
        self.att.num_params() + self.ff.num_params() + 2 * (self.norm1.dim() + self.norm2.dim())
    }

    pub fn forward(&self, x: &Array3<f32>, ctx: &mut ForwardContext) -> Result<Array3<f32>, ModelError> {
        let h = self.norm1.forward(x)?;
        let h = self.att.forward(&h, ctx)?;
        let x = self.drop_shortcut.forward(h, ctx) + x;

        let h = self.norm2.forward(&x)?;
        let h = self.ff.forward(&h)?;
        Ok(self.drop_shortcut.forward(h, ctx) + &x)
    }
}

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[batch, seq, vocab_size]`
    pub logits: Array3<f32>,
    /// Token + positional embedding, before any block runs.
    pub pre_stack: Array3<f32>,
    /// Hidden state after the last block, before the final norm.
    pub post_stack: Array3<f32>,
}

impl ModelOutput {
    /// Highest-scoring id at the last position of each batch row.
    pub fn next_token_ids(&self) -> Result<Vec<u32>, ModelError> {
        if self.logits.len_of(Axis(1)) == 0 {
            return Err(ModelError::EmptyInput);
        }
        self.logits
            .outer_iter()
            .map(|seq| {
                let last = seq.slice(s![-1, ..]);
                last.argmax()
                    .map(|id| id as u32)
                    .map_err(|e| ModelError::NonFinite { stage: format!("logits argmax ({})", e) })
            })
            .collect()
    }
}

/// Builds a rectangular `[batch, seq]` id batch, rejecting ragged input.
pub fn token_batch(sequences: &[Vec<u32>]) -> Result<Array2<u32>, ModelError> {
    let expected = sequences.first().map(|s| s.len()).ok_or(ModelError::EmptyInput)?;
    if expected == 0 {
        return Err(ModelError::EmptyInput);
    }
    let mut flat = Vec::with_capacity(sequences.len() * expected);
    for (index, seq) in sequences.iter().enumerate() {
        if seq.len() != expected {
            return Err(ModelError::RaggedBatch { index, expected, found: seq.len() });
        }
        flat.extend_from_slice(seq);
    }
    Ok(Array2::from_shape_vec((sequences.len(), expected), flat)?)
}

/// Decoder-only GPT: embeddings, a stack of [`TransformerBlock`]s, final norm, vocab head.
#[derive(Debug, Clone)]
pub struct GptModel {
    config: GptConfig,
    tok_emb: Embedding,
    pos_emb: Embedding,
    drop_emb: Dropout,
    trf_blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    out_head: Linear,
}

impl GptModel {
    /// Validates `config` and requests every parameter from `init`.
    pub fn new(config: &GptConfig, init: &mut dyn ParamInit) -> Result<Self, ModelError> {
        config.validate()?;

        let tok_emb = Embedding::new("tok_emb", config.vocab_size, config.emb_dim, init)?;
        let pos_emb = Embedding::new("pos_emb", config.context_length, config.emb_dim, init)?;

        let mut trf_blocks = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            trf_blocks.push(TransformerBlock::new(i, config, init)?);
        }

        let final_norm = LayerNorm::new("final_norm", config.emb_dim, init)?;
        let out_head = Linear::new("out_head", config.emb_dim, config.vocab_size, false, init)?;

        let model = Self {
            config: config.clone(),
            tok_emb,
            pos_emb,
            drop_emb: Dropout::new(config.drop_rate)?,
            trf_blocks,
            final_norm,
            out_head,
        };
        log::debug!(
            "built GPT model: {} layers, {} heads, emb_dim {}, {} parameters",
            config.n_layers,
            config.n_heads,
            config.emb_dim,
            model.parameter_count()
        );
        Ok(model)
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[TransformerBlock] {
        &self.trf_blocks
    }

    pub fn parameter_count(&self) -> usize {
        self.tok_emb.weight.len()
            + self.pos_emb.weight.len()
            + self.trf_blocks.iter().map(TransformerBlock::num_params).sum::<usize>()
            + 2 * self.final_norm.dim()
            + self.out_head.num_params()
    }

    fn check_ids(&self, in_ids: &Array2<u32>) -> Result<Array2<usize>, ModelError> {
        let (batch_size, seq_len) = in_ids.dim();
        if batch_size == 0 || seq_len == 0 {
            return Err(ModelError::EmptyInput);
        }
        if seq_len > self.config.context_length {
            return Err(ModelError::SequenceTooLong {
                len: seq_len,
                context_length: self.config.context_length,
            });
        }
        let vocab_size = self.config.vocab_size;
        if let Some(((batch, position), &id)) =
            in_ids.indexed_iter().find(|&(_, &id)| id as usize >= vocab_size)
        {
            return Err(ModelError::TokenOutOfRange { batch, position, id, vocab_size });
        }
        Ok(in_ids.mapv(|id| id as usize))
    }

    /// Token + positional embedding for a checked id grid.
    fn embed(&self, ids: &Array2<usize>) -> Array3<f32> {
        let seq_len = ids.ncols();
        let tok_embeds = self.tok_emb.lookup(ids);
        let pos_embeds = self.pos_emb.weight.slice(s![..seq_len, ..]);
        tok_embeds + &pos_embeds
    }

    pub fn forward(&self, in_ids: &Array2<u32>, ctx: &mut ForwardContext) -> Result<ModelOutput, ModelError> {
        let ids = self.check_ids(in_ids)?;
        log::debug!("forward: input ids {:?}", ids.shape());

        let x = self.embed(&ids);
        ctx.check_finite("embedding", &x)?;
        let pre_stack = x.clone();
        log::debug!("embedding output {:?}", x.shape());

        let mut x = self.drop_emb.forward(x, ctx);
        log::debug!("embedding dropout output {:?}", x.shape());

        for (i, block) in self.trf_blocks.iter().enumerate() {
            x = block.forward(&x, ctx)?;
            ctx.check_finite(&format!("transformer block {}", i), &x)?;
            log::debug!("transformer block {} output {:?}", i, x.shape());
        }
        let post_stack = x.clone();

        let x = self.final_norm.forward(&x)?;
        log::debug!("final norm output {:?}", x.shape());
        let logits = self.out_head.forward(&x)?;
        ctx.check_finite("output head", &logits)?;
        log::debug!("logits {:?}", logits.shape());

        Ok(ModelOutput { logits, pre_stack, post_stack })
    }

    /// Same as [`GptModel::forward`] for a list of equal-length sequences.
    pub fn forward_sequences(
        &self,
        sequences: &[Vec<u32>],
        ctx: &mut ForwardContext,
    ) -> Result<ModelOutput, ModelError> {
        self.forward(&token_batch(sequences)?, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::{ConstantInit, NormalInit};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, ArrayD, IxDyn};
    use std::collections::HashMap;

    fn tiny_config() -> GptConfig {
        GptConfig {
            vocab_size: 32,
            context_length: 6,
            emb_dim: 8,
            n_heads: 2,
            n_layers: 2,
            drop_rate: 0.0,
            qkv_bias: false,
        }
    }

    #[test]
    fn test_block_with_zero_sublayers_is_identity() {
        let block = TransformerBlock::new(0, &tiny_config(), &mut ConstantInit(0.0)).unwrap();
        let x = Array3::from_shape_fn((2, 4, 8), |(b, t, d)| (b as f32) - (t as f32) * 0.5 + d as f32 * 0.25);
        let y = block.forward(&x, &mut ForwardContext::inference()).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_block_shape_and_param_count() {
        let config = tiny_config();
        let block = TransformerBlock::new(0, &config, &mut NormalInit::gpt2(0).unwrap()).unwrap();
        let y = block
            .forward(&Array3::ones((3, 5, 8)), &mut ForwardContext::inference())
            .unwrap();
        assert_eq!(y.dim(), (3, 5, 8));
        let attn = 4 * 64 + 8;
        let ff = 8 * 32 + 32 + 32 * 8 + 8;
        assert_eq!(block.num_params(), attn + ff + 4 * 8);
    }

    #[test]
    fn test_dropout_never_touches_residual_path() {
        let config = GptConfig { drop_rate: 0.9, ..tiny_config() };
        let block = TransformerBlock::new(0, &config, &mut ConstantInit(0.0)).unwrap();
        let x = Array3::from_shape_fn((2, 4, 8), |(b, t, d)| 1.0 + b as f32 + t as f32 * 0.5 - d as f32 * 0.25);
        for seed in [5u64, 17, 123] {
            let y = block.forward(&x, &mut ForwardContext::training(seed)).unwrap();
            assert_eq!(x, y);
        }
    }

    fn block_weights(norm1_scale: f32, norm2_scale: f32, norm2_shift: f32) -> HashMap<String, ArrayD<f32>> {
        let shapes: [(&str, &[usize]); 12] = [
            ("att.w_query.weight", &[8, 8]),
            ("att.w_key.weight", &[8, 8]),
            ("att.w_value.weight", &[8, 8]),
            ("att.out_proj.weight", &[8, 8]),
            ("att.out_proj.bias", &[8]),
            ("ff.linear1.weight", &[8, 32]),
            ("ff.linear1.bias", &[32]),
            ("ff.linear2.weight", &[32, 8]),
            ("ff.linear2.bias", &[8]),
            ("norm1.shift", &[8]),
            ("norm1.scale", &[8]),
            ("norm2.scale", &[8]),
        ];
        let mut weights: HashMap<String, ArrayD<f32>> = shapes
            .iter()
            .map(|(name, shape)| (format!("blocks.0.{}", name), ArrayD::zeros(IxDyn(shape))))
            .collect();
        weights.insert("blocks.0.norm1.scale".into(), ArrayD::from_elem(IxDyn(&[8]), norm1_scale));
        weights.insert("blocks.0.norm2.scale".into(), ArrayD::from_elem(IxDyn(&[8]), norm2_scale));
        weights.insert("blocks.0.norm2.shift".into(), ArrayD::from_elem(IxDyn(&[8]), norm2_shift));
        weights
    }

    #[test]
    fn test_block_norms_load_their_own_parameters() {
        let mut weights = block_weights(2.0, 0.5, 1.0);
        let block = TransformerBlock::new(0, &tiny_config(), &mut weights).unwrap();
        assert!(block.norm1.scale.iter().all(|&v| v == 2.0));
        assert!(block.norm1.shift.iter().all(|&v| v == 0.0));
        assert!(block.norm2.scale.iter().all(|&v| v == 0.5));
        assert!(block.norm2.shift.iter().all(|&v| v == 1.0));

        let x = Array3::from_shape_fn((1, 1, 8), |(_, _, d)| d as f32);
        let inv_std = 1.0 / (5.25f32 + LayerNorm::EPSILON).sqrt();
        let y1 = block.norm1.forward(&x).unwrap();
        let y2 = block.norm2.forward(&x).unwrap();
        for d in 0..8 {
            let normed = (d as f32 - 3.5) * inv_std;
            assert_abs_diff_eq!(y1[[0, 0, d]], 2.0 * normed, epsilon = 1e-5);
            assert_abs_diff_eq!(y2[[0, 0, d]], 0.5 * normed + 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_model_output_shapes() {
        let model = GptModel::new(&tiny_config(), &mut NormalInit::gpt2(7).unwrap()).unwrap();
        let ids = arr2(&[[1u32, 2, 3], [4, 5, 6]]);
        let out = model.forward(&ids, &mut ForwardContext::inference()).unwrap();
        assert_eq!(out.logits.dim(), (2, 3, 32));
        assert_eq!(out.pre_stack.dim(), (2, 3, 8));
        assert_eq!(out.post_stack.dim(), (2, 3, 8));
    }

    #[test]
    fn test_pre_stack_is_token_plus_position() {
        let model = GptModel::new(&tiny_config(), &mut NormalInit::gpt2(3).unwrap()).unwrap();
        let ids = arr2(&[[5u32, 9]]);
        let out = model.forward(&ids, &mut ForwardContext::inference()).unwrap();
        for (t, &id) in [5usize, 9].iter().enumerate() {
            for d in 0..8 {
                let expected = model.tok_emb.weight[[id, d]] + model.pos_emb.weight[[t, d]];
                assert_abs_diff_eq!(out.pre_stack[[0, t, d]], expected, epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn test_inference_is_deterministic() {
        let model = GptModel::new(&tiny_config(), &mut NormalInit::gpt2(1).unwrap()).unwrap();
        let ids = arr2(&[[0u32, 31, 7, 7]]);
        let a = model.forward(&ids, &mut ForwardContext::inference()).unwrap();
        let b = model.forward(&ids, &mut ForwardContext::inference()).unwrap();
        assert_eq!(a.logits, b.logits);
        assert_eq!(a.post_stack, b.post_stack);
    }

    #[test]
    fn test_training_dropout_reproducible_by_seed() {
        let config = GptConfig { drop_rate: 0.2, ..tiny_config() };
        let model = GptModel::new(&config, &mut NormalInit::gpt2(1).unwrap()).unwrap();
        let ids = arr2(&[[3u32, 1, 4, 1, 5]]);
        let a = model.forward(&ids, &mut ForwardContext::training(99)).unwrap();
        let b = model.forward(&ids, &mut ForwardContext::training(99)).unwrap();
        let clean = model.forward(&ids, &mut ForwardContext::inference()).unwrap();
        assert_eq!(a.logits, b.logits);
        assert_ne!(a.logits, clean.logits);
        // the snapshot is taken before embedding dropout
        assert_eq!(a.pre_stack, clean.pre_stack);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let model = GptModel::new(&tiny_config(), &mut ConstantInit(0.0)).unwrap();
        let mut ctx = ForwardContext::inference();

        let too_long = Array2::<u32>::zeros((1, 7));
        assert!(matches!(
            model.forward(&too_long, &mut ctx),
            Err(ModelError::SequenceTooLong { len: 7, context_length: 6 })
        ));

        let bad_id = arr2(&[[1u32, 2], [3, 32]]);
        assert!(matches!(
            model.forward(&bad_id, &mut ctx),
            Err(ModelError::TokenOutOfRange { batch: 1, position: 1, id: 32, vocab_size: 32 })
        ));

        assert!(matches!(model.forward(&Array2::<u32>::zeros((1, 0)), &mut ctx), Err(ModelError::EmptyInput)));
        assert!(matches!(
            model.forward_sequences(&[vec![1, 2], vec![3]], &mut ctx),
            Err(ModelError::RaggedBatch { index: 1, expected: 2, found: 1 })
        ));
    }

    #[test]
    fn test_indivisible_heads_prevent_construction() {
        let config = GptConfig { emb_dim: 12, n_heads: 5, ..tiny_config() };
        assert!(matches!(
            GptModel::new(&config, &mut ConstantInit(0.0)),
            Err(ModelError::Config { .. })
        ));
    }

    #[test]
    fn test_token_batch() {
        let batch = token_batch(&[vec![1, 2, 3], vec![4, 5, 6]]).unwrap();
        assert_eq!(batch, arr2(&[[1u32, 2, 3], [4, 5, 6]]));
        assert!(matches!(token_batch(&[]), Err(ModelError::EmptyInput)));
        assert!(matches!(token_batch(&[vec![]]), Err(ModelError::EmptyInput)));
    }

    #[test]
    fn test_next_token_ids_uses_last_position() {
        let mut logits = Array3::zeros((2, 3, 4));
        logits[[0, 2, 3]] = 5.0;
        logits[[0, 0, 1]] = 9.0;
        logits[[1, 2, 2]] = 1.0;
        let out = ModelOutput {
            logits,
            pre_stack: Array3::zeros((2, 3, 1)),
            post_stack: Array3::zeros((2, 3, 1)),
        };
        assert_eq!(out.next_token_ids().unwrap(), vec![3, 2]);
    }

    #[test]
    fn test_next_token_ids_on_empty_sequence() {
        let out = ModelOutput {
            logits: Array3::zeros((2, 0, 4)),
            pre_stack: Array3::zeros((2, 0, 1)),
            post_stack: Array3::zeros((2, 0, 1)),
        };
        assert!(matches!(out.next_token_ids(), Err(ModelError::EmptyInput)));
    }

    #[test]
    fn test_parameter_count() {
        let config = tiny_config();
        let model = GptModel::new(&config, &mut ConstantInit(0.0)).unwrap();
        let block = 4 * 64 + 8 + (8 * 32 + 32 + 32 * 8 + 8) + 4 * 8;
        let expected = 32 * 8 + 6 * 8 + 2 * block + 2 * 8 + 8 * 32;
        assert_eq!(model.parameter_count(), expected);
    }

    #[test]
    fn test_weight_map_must_be_complete() {
        let mut weights: HashMap<String, ArrayD<f32>> = HashMap::new();
        weights.insert("tok_emb.weight".into(), ArrayD::zeros(IxDyn(&[32, 8])));
        match GptModel::new(&tiny_config(), &mut weights) {
            Err(ModelError::WeightNotFound(name)) => assert_eq!(name, "pos_emb.weight"),
            other => panic!("expected missing weight, got {:?}", other.map(|_| ())),
        }
    }
}
