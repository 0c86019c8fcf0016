//! Attention with linear biases (alibi).
//!
//! Every head `h` penalises a query/key pair by `slope_h * |i - j|`. Slopes form
//! a geometric sequence seeded by the head count so that the assignment is
//! identical for every backend.

use candle_core::{Device, Result, Tensor};

/// Per-head slopes: `2^-(k * bias_max / n')` for `k = 1..=n'`, where `n'` is
/// the head count rounded up to a power of two. When rounding happened the odd
/// entries come first, then the even ones, truncated to `n_heads`.
pub fn gen_slopes(n_heads: usize, bias_max: f32) -> Vec<f32> {
    if n_heads == 0 {
        return Vec::new();
    }
    let padded = n_heads.next_power_of_two();
    let slopes: Vec<f32> = (1..=padded)
        .map(|k| 1.0 / 2f32.powf(k as f32 * bias_max / padded as f32))
        .collect();
    if padded == n_heads {
        return slopes;
    }
    slopes
        .iter()
        .skip(1)
        .step_by(2)
        .chain(slopes.iter().step_by(2))
        .take(n_heads)
        .copied()
        .collect()
}

/// [`gen_slopes`] as an `f32` tensor shaped `[n_heads]`.
pub fn alibi_slopes(n_heads: usize, bias_max: f32, device: &Device) -> Result<Tensor> {
    Tensor::from_vec(gen_slopes(n_heads, bias_max), n_heads, device)
}

/// Alibi distances for explicit positions: `-slope_h * |q_pos - k_pos|`.
///
/// `slopes` is `[heads]`, `q_pos` is `[q]` and `k_pos` is `[k]` (both `f32`);
/// the result is `[1, heads, q, k]`.
pub fn alibi_from_positions(slopes: &Tensor, q_pos: &Tensor, k_pos: &Tensor) -> Result<Tensor> {
    let heads = slopes.dim(0)?;
    let q_len = q_pos.dim(0)?;
    let k_len = k_pos.dim(0)?;
    let distance = q_pos
        .reshape((q_len, 1))?
        .broadcast_sub(&k_pos.reshape((1, k_len))?)?
        .abs()?
        .reshape((1, 1, q_len, k_len))?;
    distance
        .broadcast_mul(&slopes.reshape((1, heads, 1, 1))?)?
        .neg()
}

/// Alibi bias shaped `[1, n_heads, q_len, k_len]` with queries aligned to the
/// most recent keys.
pub fn build_alibi_bias(
    n_heads: usize,
    q_len: usize,
    k_len: usize,
    bias_max: f32,
    device: &Device,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let slopes = alibi_slopes(n_heads, bias_max, device)?;
    let q_pos = Tensor::arange(offset as f32, (offset + q_len) as f32, device)?;
    let k_pos = Tensor::arange(0f32, k_len as f32, device)?;
    alibi_from_positions(&slopes, &q_pos, &k_pos)
}
