use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::ModelError;

/// Architecture hyperparameters. Immutable once the model is built.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GptConfig {
    pub vocab_size: usize,
    #[serde(alias = "n_positions", alias = "max_position_embeddings")]
    pub context_length: usize,
    #[serde(alias = "n_embd", alias = "hidden_size")]
    pub emb_dim: usize,
    #[serde(alias = "n_head", alias = "num_attention_heads")]
    pub n_heads: usize,
    #[serde(alias = "n_layer", alias = "num_hidden_layers")]
    pub n_layers: usize,
    #[serde(default)]
    pub drop_rate: f32,
    #[serde(default)]
    pub qkv_bias: bool,
}

impl GptConfig {
    /// The small walkthrough configuration: one single-head block over a 12-wide embedding.
    pub fn demo() -> Self {
        Self {
            vocab_size: 50257,
            context_length: 20,
            emb_dim: 12,
            n_heads: 1,
            n_layers: 1,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// GPT-2 124M shape.
    pub fn gpt2_small() -> Self {
        Self {
            vocab_size: 50257,
            context_length: 1024,
            emb_dim: 768,
            n_heads: 12,
            n_layers: 12,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    pub fn load(config_path: &str) -> Result<Self, ModelError> {
        if !Path::new(config_path).exists() {
            return Err(ModelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Config file not found at: {}", config_path),
            )));
        }

        let mut file = File::open(config_path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        Self::from_json_str(&contents)
    }

    /// Parses and validates in one step.
    pub fn from_json_str(json: &str) -> Result<Self, ModelError> {
        let config: GptConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("context_length", self.context_length),
            ("emb_dim", self.emb_dim),
            ("n_heads", self.n_heads),
            ("n_layers", self.n_layers),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ModelError::config(field, "must be a positive integer"));
            }
        }
        if self.emb_dim % self.n_heads != 0 {
            return Err(ModelError::config(
                "emb_dim",
                format!(
                    "emb_dim ({}) must be divisible by n_heads ({})",
                    self.emb_dim, self.n_heads
                ),
            ));
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(ModelError::config(
                "drop_rate",
                format!("drop_rate ({}) must lie in [0, 1)", self.drop_rate),
            ));
        }
        if self.vocab_size > u32::MAX as usize {
            return Err(ModelError::config("vocab_size", "token ids are u32"));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.emb_dim / self.n_heads
    }

    pub fn ff_hidden_dim(&self) -> usize {
        4 * self.emb_dim
    }
}

impl Default for GptConfig {
    fn default() -> Self {
        Self::demo()
    }
}
