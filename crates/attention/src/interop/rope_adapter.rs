//! Integration with the rotary embeddings of the `embedding` crate.
//!
//! A model builds one [`RotaryEmbedding`] and, per forward pass, one adapter
//! that pairs it with the positions of the current tokens (a decode offset or
//! padding-adjusted ids). Every layer rotates through the same adapter, so
//! all layers agree on positions.

use candle_core::Tensor;
use embedding::positional::{RotaryEmbedding, RotaryPositions, RotaryRole};

use crate::core::AttentionError;

#[derive(Debug, Clone)]
pub struct RopeAdapter<'a> {
    embedding: &'a RotaryEmbedding,
    positions: RotaryPositions,
}

impl<'a> RopeAdapter<'a> {
    pub fn new(embedding: &'a RotaryEmbedding, positions: RotaryPositions) -> Self {
        Self {
            embedding,
            positions,
        }
    }

    pub fn embedding(&self) -> &RotaryEmbedding {
        self.embedding
    }

    pub fn positions(&self) -> &RotaryPositions {
        &self.positions
    }

    fn rotate(&self, x: &Tensor, role: RotaryRole) -> Result<Tensor, AttentionError> {
        let head_dim = x.dim(3)?;
        let expected = self.embedding.config().head_dim;
        if head_dim != expected {
            return Err(AttentionError::shape(format!(
                "rotary embedding built for head_dim {expected}, got {head_dim}"
            )));
        }
        Ok(self.embedding.rotate(x, &self.positions, role)?)
    }

    /// Rotates queries shaped `[batch, heads, seq, head_dim]`.
    pub fn rotate_query(&self, q: &Tensor) -> Result<Tensor, AttentionError> {
        self.rotate(q, RotaryRole::Query)
    }

    /// Rotates keys shaped `[batch, kv_heads, seq, head_dim]`.
    pub fn rotate_key(&self, k: &Tensor) -> Result<Tensor, AttentionError> {
        self.rotate(k, RotaryRole::Key)
    }

    /// Rotates queries and, when present, keys. Layers reusing another
    /// layer's keys pass `None`: those keys were rotated by their producer.
    pub fn apply(
        &self,
        q: &Tensor,
        k: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>), AttentionError> {
        let q = self.rotate_query(q)?;
        let k = k.map(|k| self.rotate_key(k)).transpose()?;
        Ok((q, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use embedding::positional::RotaryConfig;

    fn allclose(a: &Tensor, b: &Tensor, tol: f32) -> candle_core::Result<bool> {
        let diff = a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        Ok(diff <= tol)
    }

    #[test]
    fn adapter_matches_direct_rotation() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let rotary = RotaryEmbedding::new(RotaryConfig::new(8, 32))?;
        let q = Tensor::randn(0f32, 1.0, (1, 4, 3, 8), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 2, 3, 8), &device)?;

        let adapter = RopeAdapter::new(&rotary, RotaryPositions::Offset(5));
        let (adapt_q, adapt_k) = adapter.apply(&q, Some(&k))?;
        let direct_q = rotary.rotate(&q, &RotaryPositions::Offset(5), RotaryRole::Query)?;
        let direct_k = rotary.rotate(&k, &RotaryPositions::Offset(5), RotaryRole::Key)?;

        assert!(allclose(&adapt_q, &direct_q, 1e-6)?);
        assert!(allclose(&adapt_k.expect("keys rotated"), &direct_k, 1e-6)?);
        Ok(())
    }

    #[test]
    fn query_only_rotation_for_reused_keys() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let rotary = RotaryEmbedding::new(RotaryConfig::new(4, 16))?;
        let q = Tensor::ones((1, 1, 2, 4), DType::F32, &device)?;
        let adapter = RopeAdapter::new(&rotary, RotaryPositions::Offset(0));
        let (rotated, keys) = adapter.apply(&q, None)?;
        assert!(keys.is_none());
        // Position zero is the identity rotation.
        assert!(allclose(&rotated.narrow(2, 0, 1)?, &q.narrow(2, 0, 1)?, 1e-6)?);
        Ok(())
    }

    #[test]
    fn head_dim_mismatch_is_a_shape_error() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let rotary = RotaryEmbedding::new(RotaryConfig::new(8, 16))?;
        let q = Tensor::zeros((1, 1, 2, 4), DType::F32, &device)?;
        let adapter = RopeAdapter::new(&rotary, RotaryPositions::Offset(0));
        assert!(matches!(
            adapter.rotate_query(&q),
            Err(AttentionError::InvalidShape { .. })
        ));
        Ok(())
    }
}
