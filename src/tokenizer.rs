use ndarray::Array2;
use std::path::Path;
use tokenizers::decoders::DecoderWrapper;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::pre_tokenizers::PreTokenizerWrapper;
use tokenizers::Tokenizer;

use crate::error::ModelError;

pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Text <-> id mapping the model consumes. The model never sees text itself.
pub trait TokenEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>, ModelError>;
    fn decode(&self, ids: &[u32]) -> Result<String, ModelError>;
    /// Id of the end-of-text marker; an ordinary vocabulary entry to the model.
    fn end_of_text_id(&self) -> Option<u32>;
}

/// Byte-level BPE tokenizer backed by the `tokenizers` crate.
pub struct Gpt2Tokenizer {
    tokenizer: Tokenizer,
}

impl Gpt2Tokenizer {
    /// Loads a serialized `tokenizer.json`.
    pub fn from_file(tokenizer_path: &Path) -> Result<Self, ModelError> {
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            ModelError::Tokenizer(format!("Failed to load tokenizer from {:?}: {}", tokenizer_path, e))
        })?;
        Ok(Self { tokenizer })
    }

    /// Builds the tokenizer from GPT-2 style `vocab.json` and `merges.txt`.
    pub fn from_vocab_and_merges(vocab_path: &str, merges_path: &str) -> Result<Self, ModelError> {
        if !Path::new(vocab_path).exists() {
            return Err(ModelError::Tokenizer(format!("Vocabulary file not found at: {}", vocab_path)));
        }
        if !Path::new(merges_path).exists() {
            return Err(ModelError::Tokenizer(format!("Merges file not found at: {}", merges_path)));
        }

        let bpe_model = BPE::from_file(vocab_path, merges_path)
            .build()
            .map_err(|e| ModelError::Tokenizer(format!("Failed to build BPE model: {}", e)))?;

        let mut tokenizer = Tokenizer::new(bpe_model);
        tokenizer.with_pre_tokenizer(PreTokenizerWrapper::from(
            ByteLevel::default().add_prefix_space(false),
        ));
        tokenizer.with_decoder(DecoderWrapper::from(ByteLevel::default()));

        Ok(Self { tokenizer })
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl TokenEncoder for Gpt2Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, ModelError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| ModelError::Tokenizer(format!("Encoding failed for text '{}': {}", text, e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, ModelError> {
        self.tokenizer
            .decode(ids, false)
            .map_err(|e| ModelError::Tokenizer(format!("Decoding failed for IDs {:?}: {}", ids, e)))
    }

    fn end_of_text_id(&self) -> Option<u32> {
        self.tokenizer.token_to_id(END_OF_TEXT)
    }
}

/// Encodes `text` as a single-row `[1, T]` batch.
pub fn text_to_token_ids(text: &str, encoder: &dyn TokenEncoder) -> Result<Array2<u32>, ModelError> {
    let ids = encoder.encode(text)?;
    if ids.is_empty() {
        return Err(ModelError::EmptyInput);
    }
    let len = ids.len();
    Ok(Array2::from_shape_vec((1, len), ids)?)
}
