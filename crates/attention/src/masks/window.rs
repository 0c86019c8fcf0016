//! Sliding-window masks.

use candle_core::{Device, Result, Tensor};

/// `u8` mask shaped `[q_len, k_len]`, `1` where `|query_pos - key_pos| <= window`.
///
/// Query positions carry the same `k_len - q_len` offset as the causal mask,
/// so a single decoded token keeps the last `window` keys. Combined with the
/// causal mask this leaves keys `[pos - window, pos]`.
pub fn window_allowed(device: &Device, q_len: usize, k_len: usize, window: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let q_pos = Tensor::arange(offset as f32, (offset + q_len) as f32, device)?
        .reshape((q_len, 1))?;
    let k_pos = Tensor::arange(0f32, k_len as f32, device)?.reshape((1, k_len))?;
    q_pos.broadcast_sub(&k_pos)?.abs()?.le(window as f32)
}
