use attention::{AttentionError, ConfigError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to parse model configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("context of {len} tokens exceeds max_seq_len {max}")]
    SequenceTooLong { len: usize, max: usize },
}

impl From<ConfigError> for ModelError {
    fn from(err: ConfigError) -> Self {
        ModelError::Attention(err.into())
    }
}
