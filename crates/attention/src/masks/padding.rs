//! Key-padding masks.
//!
//! Attention masks are `[batch, seq]` tensors whose non-zero entries mark real
//! tokens; any integer or float dtype is accepted.

use candle_core::{Device, Result, Tensor};

/// `u8` mask shaped `[batch, 1, 1, k_len]`, `1` for keys that are real tokens.
pub fn key_padding_allowed(attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, k_len) = attention_mask.dims2()?;
    attention_mask.ne(0u8)?.reshape((batch, 1, 1, k_len))
}

/// Right-padded `u8` attention mask with the first `lengths[b]` tokens real.
pub fn attention_mask_from_lengths(lengths: &[usize], seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0u8; lengths.len() * seq_len];
    for (b, &valid) in lengths.iter().enumerate() {
        for slot in data[b * seq_len..b * seq_len + valid.min(seq_len)].iter_mut() {
            *slot = 1;
        }
    }
    Tensor::from_vec(data, (lengths.len(), seq_len), device)
}
