//! Builders for causal attention masks.
//!
//! When `k_len > q_len`, queries are aligned with the most recent `q_len`
//! keys, so query `i` sits at absolute position `i + k_len - q_len` and may
//! see every key up to and including that position.

use candle_core::{Device, Result, Tensor};

use super::{MASK_DTYPE, MASK_FILL};

/// `u8` mask shaped `[q_len, k_len]`, `1` where the key is not in the future.
pub fn causal_allowed(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let q_pos = Tensor::arange(offset as f32, (offset + q_len) as f32, device)?
        .reshape((q_len, 1))?;
    let k_pos = Tensor::arange(0f32, k_len as f32, device)?.reshape((1, k_len))?;
    k_pos.broadcast_le(&q_pos)
}

/// Additive causal mask shaped `[batch, num_heads, q_len, k_len]`.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let shape = (batch, num_heads, q_len, k_len);
    let allowed = causal_allowed(device, q_len, k_len)?
        .reshape((1, 1, q_len, k_len))?
        .broadcast_as(shape)?;
    let zeros = Tensor::zeros(shape, MASK_DTYPE, device)?;
    let fill = Tensor::full(MASK_FILL, shape, device)?;
    allowed.where_cond(&zeros, &fill)
}
