//! Position ids for rotary embeddings.

use candle_core::{DType, Device, Result, Tensor, D};

/// Plain `past_len + 0..seq_len` positions broadcast to every batch row.
pub fn offset_positions(
    batch: usize,
    seq_len: usize,
    past_len: usize,
    device: &Device,
) -> Result<Tensor> {
    Tensor::arange(past_len as u32, (past_len + seq_len) as u32, device)?
        .unsqueeze(0)?
        .repeat((batch, 1))
}

/// Positions that skip padding: `clamp(past_len + i - #pad[0..=i], 0)`.
///
/// `attention_mask` is `[batch, seq]` with non-zero entries marking real
/// tokens. With left padding the first real token of every row lands on
/// position `past_len`, and right padding repeats the last real position.
/// Returns `u32` ids shaped `[batch, seq]`.
pub fn padding_adjusted_positions(attention_mask: &Tensor, past_len: usize) -> Result<Tensor> {
    let (_batch, seq_len) = attention_mask.dims2()?;
    let device = attention_mask.device();
    let real = attention_mask.ne(0u8)?.to_dtype(DType::F32)?;
    let padding_seen = real.affine(-1.0, 1.0)?.cumsum(D::Minus1)?;
    let arange = Tensor::arange(past_len as f32, (past_len + seq_len) as f32, device)?
        .unsqueeze(0)?;
    arange
        .broadcast_sub(&padding_seen)?
        .maximum(0f32)?
        .to_dtype(DType::U32)
}
