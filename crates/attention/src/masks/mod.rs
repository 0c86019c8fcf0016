//! Mask and bias builders shared by attention kernels.
//!
//! Additive biases are `f32` tensors broadcastable onto the
//! `[batch, heads, q_len, k_len]` score tensor. Permitted entries are `0.0`
//! (plus any alibi term) and forbidden entries hold [`MASK_FILL`], the most
//! negative finite `f32`, so fully masked rows still produce a finite softmax.
//! Boolean "allowed" masks are `u8` tensors used with `where_cond`.

pub mod alibi;
pub mod causal;
pub mod padding;
pub mod sequence;
pub mod window;

use candle_core::{DType, Device, Tensor};

use crate::core::{AttentionError, Backend};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Value written into forbidden score entries.
pub const MASK_FILL: f32 = f32::MIN;

pub use alibi::{alibi_slopes, build_alibi_bias, gen_slopes};
pub use causal::{build_causal_mask, causal_allowed};
pub use padding::{attention_mask_from_lengths, key_padding_allowed};
pub use sequence::apply_sequence_id;
pub use window::window_allowed;

/// Shape of the dense bias a backend needs, or `None` when it needs none.
pub fn attn_bias_shape(
    backend: &Backend,
    num_heads: usize,
    seq_len: usize,
    use_relative_bias: bool,
    use_sequence_id_mask: bool,
    causal: bool,
) -> Option<[usize; 4]> {
    if backend.is_fused() {
        return None;
    }
    if use_relative_bias {
        Some([1, num_heads, seq_len, seq_len])
    } else if causal || use_sequence_id_mask {
        Some([1, 1, seq_len, seq_len])
    } else {
        None
    }
}

/// Builds the dense additive bias for a `seq_len x seq_len` window.
///
/// Fused backends consume packing descriptors instead and get `None`.
/// Sequence-id masking needs per-row data and is applied afterwards with
/// [`apply_sequence_id`]; here it only decides whether a bias is needed.
#[allow(clippy::too_many_arguments)]
pub fn build_bias(
    backend: &Backend,
    num_heads: usize,
    seq_len: usize,
    use_relative_bias: bool,
    use_sequence_id_mask: bool,
    causal: bool,
    relative_bias_max: f32,
    device: &Device,
) -> Result<Option<Tensor>, AttentionError> {
    let Some(shape) = attn_bias_shape(
        backend,
        num_heads,
        seq_len,
        use_relative_bias,
        use_sequence_id_mask,
        causal,
    ) else {
        return Ok(None);
    };

    let mut bias = Tensor::zeros(shape.as_slice(), MASK_DTYPE, device)?;
    if use_relative_bias {
        bias = bias.broadcast_add(&build_alibi_bias(
            num_heads,
            seq_len,
            seq_len,
            relative_bias_max,
            device,
        )?)?;
    }
    if causal {
        let allowed = causal_allowed(device, seq_len, seq_len)?
            .reshape((1, 1, seq_len, seq_len))?
            .broadcast_as(bias.shape())?;
        let fill = Tensor::full(MASK_FILL, bias.shape(), device)?;
        bias = allowed.where_cond(&bias, &fill)?;
    }
    Ok(Some(bias))
}

/// Slices a bias built for a longer window down to its trailing
/// `[q_len, k_len]` corner, aligning queries with the most recent keys.
pub fn trailing_window(bias: &Tensor, q_len: usize, k_len: usize) -> Result<Tensor, AttentionError> {
    let (_, _, rows, cols) = bias
        .dims4()
        .map_err(|_| AttentionError::shape("attention bias must be rank 4"))?;
    if rows < q_len || cols < k_len {
        return Err(AttentionError::shape(format!(
            "attention bias window [{rows}, {cols}] smaller than scores [{q_len}, {k_len}]"
        )));
    }
    Ok(bias.narrow(2, rows - q_len, q_len)?.narrow(3, cols - k_len, k_len)?)
}

#[cfg(test)]
mod tests;
