//! Error types emitted by attention implementations.

use thiserror::Error;

use super::config::KernelVersion;

/// Fatal configuration mistakes. Fix the configuration; retrying cannot help.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("n_heads={heads} is not divisible by kv_n_heads={kv_heads}")]
    IndivisibleHeads { heads: usize, kv_heads: usize },
    #[error("invalid kv_n_heads={kv_heads}: {reason}")]
    InvalidKvHeads { kv_heads: i64, reason: &'static str },
    #[error("kv_n_heads must be set for grouped query attention")]
    MissingKvHeads,
    #[error("d_model={d_model} is not divisible by n_heads={heads}")]
    WidthNotDivisible { d_model: usize, heads: usize },
    #[error("conflicting position encodings: {0}")]
    ConflictingPositionEncodings(&'static str),
    #[error("qk_ln and qk_gn are mutually exclusive")]
    ConflictingQkNorm,
    #[error("sliding_window_size must be -1 or non-negative, got {0}")]
    InvalidSlidingWindow(i64),
    #[error("attn_pdrop must be in [0, 1), got {0}")]
    InvalidDropout(f32),
    #[error("{name} must be positive and finite, got {value}")]
    InvalidPositive { name: &'static str, value: f64 },
    #[error("unknown {field} `{value}`")]
    UnknownOption { field: &'static str, value: String },
    #[error("invalid fused kernel version `{0}`")]
    InvalidKernelVersion(String),
    #[error("layer {layer} cannot reuse kv cache of layer {target}: only earlier layers may be reused")]
    ForwardReuse { layer: usize, target: i64 },
    #[error("layer {layer} cannot reuse layer {target} which itself reuses another layer")]
    ChainedReuse { layer: usize, target: usize },
}

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The selected backend is too old for a requested feature.
    #[error("{feature} requires fused kernel >= {required}, found {found}; upgrade the backend")]
    Capability {
        feature: &'static str,
        required: KernelVersion,
        found: KernelVersion,
    },
    /// A per-call request the selected backend can never serve.
    #[error("unsupported request: {context}")]
    Unsupported { context: String },
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A backend-specific failure propagated to the caller.
    #[error("{message}")]
    Backend { message: String },
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        AttentionError::InvalidShape {
            context: context.into(),
        }
    }
}
