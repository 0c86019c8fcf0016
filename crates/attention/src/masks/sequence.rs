//! Sequence-id masking for packed batches.

use candle_core::{Tensor, D};

use super::{trailing_window, MASK_FILL};
use crate::core::AttentionError;
use crate::packing::{batch_segments, segment_labels};

/// Forbids every pair whose segments differ.
///
/// `sequence_id` is `[batch, seq]`; `bias` is any `[1|batch, heads, >=seq, >=seq]`
/// bias and is sliced to its trailing `[seq, seq]` window first. Segments
/// follow [`crate::packing::row_segments`], so padding positions (mask `0` or
/// id `-1`) only ever match themselves. Returns `[batch, heads, seq, seq]`.
pub fn apply_sequence_id(
    bias: &Tensor,
    sequence_id: &Tensor,
    attention_mask: Option<&Tensor>,
) -> Result<Tensor, AttentionError> {
    let (batch, seq_len) = sequence_id
        .dims2()
        .map_err(|_| AttentionError::shape("sequence_id must be [batch, seq_len]"))?;
    let bias = trailing_window(bias, seq_len, seq_len)?;
    let heads = bias.dim(1)?;
    let device = bias.device();

    let labels: Vec<u32> = batch_segments(Some(sequence_id), attention_mask, seq_len)?
        .iter()
        .flat_map(|segments| segment_labels(segments, seq_len))
        .collect();
    let labels = Tensor::from_vec(labels, (batch, seq_len), device)?;
    let same_segment = labels
        .unsqueeze(D::Minus1)?
        .broadcast_eq(&labels.unsqueeze(1)?)?
        .unsqueeze(1)?;

    let shape = (batch, heads, seq_len, seq_len);
    let bias = bias.broadcast_as(shape)?;
    let fill = Tensor::full(MASK_FILL, shape, device)?;
    Ok(same_segment.broadcast_as(shape)?.where_cond(&bias, &fill)?)
}
