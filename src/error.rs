use std::fmt;

/// Every failure the forward pass and its collaborators can report.
#[derive(Debug)]
pub enum ModelError {
    /// A configuration field is out of range. Raised before any weight is built.
    Config { field: &'static str, reason: String },
    SequenceTooLong { len: usize, context_length: usize },
    RaggedBatch { index: usize, expected: usize, found: usize },
    TokenOutOfRange { batch: usize, position: usize, id: u32, vocab_size: usize },
    EmptyInput,
    ShapeMismatch(String),
    WeightNotFound(String),
    NonFinite { stage: String },
    Tokenizer(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl ModelError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        ModelError::Config { field, reason: reason.into() }
    }

    /// True for the errors a caller fixes by changing the input batch.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ModelError::SequenceTooLong { .. }
                | ModelError::RaggedBatch { .. }
                | ModelError::TokenOutOfRange { .. }
                | ModelError::EmptyInput
        )
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Config { field, reason } => {
                write!(f, "Configuration error in `{}`: {}", field, reason)
            }
            ModelError::SequenceTooLong { len, context_length } => write!(
                f,
                "Sequence length ({}) exceeds context length ({})",
                len, context_length
            ),
            ModelError::RaggedBatch { index, expected, found } => write!(
                f,
                "Batch element {} has length {}, expected {}",
                index, found, expected
            ),
            ModelError::TokenOutOfRange { batch, position, id, vocab_size } => write!(
                f,
                "Token ID {} at [{}, {}] is out of vocab size {}",
                id, batch, position, vocab_size
            ),
            ModelError::EmptyInput => write!(f, "Input batch cannot be empty"),
            ModelError::ShapeMismatch(s) => write!(f, "Shape mismatch: {}", s),
            ModelError::WeightNotFound(s) => write!(f, "Weight not found: {}", s),
            ModelError::NonFinite { stage } => {
                write!(f, "Non-finite values produced by {}", stage)
            }
            ModelError::Tokenizer(s) => write!(f, "Tokenizer error: {}", s),
            ModelError::Io(e) => write!(f, "IO error: {}", e),
            ModelError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Io(e) => Some(e),
            ModelError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        ModelError::Io(err)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Json(err)
    }
}

impl From<ndarray::ShapeError> for ModelError {
    fn from(err: ndarray::ShapeError) -> Self {
        ModelError::ShapeMismatch(err.to_string())
    }
}
