//! Layout definitions for key/value caches.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Declarative description of a cache entry: `[batch, num_kv_heads, len, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl CacheLayout {
    pub fn new(num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_kv_heads,
            head_dim,
        }
    }

    /// Returns `(batch, len)` after checking heads and head dim.
    pub fn validate(&self, name: &str, tensor: &Tensor) -> Result<(usize, usize), AttentionError> {
        let (batch, heads, len, head_dim) = tensor.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "{name} must be [batch, {}, len, {}], got {:?}",
                self.num_kv_heads,
                self.head_dim,
                tensor.dims()
            ))
        })?;
        if heads != self.num_kv_heads || head_dim != self.head_dim {
            return Err(AttentionError::shape(format!(
                "{name} has {heads} heads of dim {head_dim}, layer expects {} heads of dim {}",
                self.num_kv_heads, self.head_dim
            )));
        }
        Ok((batch, len))
    }
}
