//! Forward pass of a decoder-only GPT-2 style transformer.
//!
//! Given a [`GptConfig`], parameters from a [`ParamInit`] and a `[batch, seq]`
//! grid of token ids, [`GptModel::forward`] returns vocabulary logits plus the
//! hidden state before and after the transformer stack.

pub mod attention;
pub mod common;
pub mod config;
pub mod dropout;
pub mod error;
pub mod init;
pub mod mlp;
pub mod model;
pub mod tokenizer;

pub use attention::MultiHeadAttention;
pub use common::{Embedding, LayerNorm, Linear};
pub use config::GptConfig;
pub use dropout::{Dropout, ForwardContext, NumericPolicy};
pub use error::ModelError;
pub use init::{ConstantInit, NormalInit, ParamInit};
pub use mlp::{FeedForward, Gelu};
pub use model::{token_batch, GptModel, ModelOutput, TransformerBlock};
pub use tokenizer::{text_to_token_ids, Gpt2Tokenizer, TokenEncoder};
