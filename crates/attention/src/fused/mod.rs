//! Tiled attention over packed segments.
//!
//! Keys are streamed in tiles and an online softmax keeps a running maximum,
//! normaliser and accumulator per query, so the full score matrix is never
//! materialised. Each row of the batch is split by its
//! [`PackingDescriptor`](crate::packing::PackingDescriptor): real segments
//! attend only within themselves and padding segments produce zeros. Padded
//! holes inside a segment are masked as keys and produce zeros as queries.
//! Tiles lying entirely above the causal diagonal or outside the sliding
//! window are skipped.

use std::ops::Range;
use std::sync::OnceLock;

use candle_core::{DType, Device, Shape, Tensor, D};
use candle_nn::ops::dropout;

use crate::core::{
    repeat_kv, validate_qkv, AttentionError, AttentionKernel, KernelOutput, KernelParams,
    MaskInputs, QkvShape,
};
use crate::masks::alibi::alibi_from_positions;
use crate::masks::MASK_FILL;
use crate::packing::{PackingDescriptor, Segment};

pub const DEFAULT_TILE_SIZE: usize = 64;

/// Online-softmax attention kernel consuming packing descriptors.
#[derive(Debug)]
pub struct FusedAttention {
    tile_size: usize,
    first_call: OnceLock<()>,
}

impl Default for FusedAttention {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            first_call: OnceLock::new(),
        }
    }
}

impl FusedAttention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key tile width; values below one are clamped to one.
    pub fn with_tile_size(mut self, tile_size: usize) -> Self {
        self.tile_size = tile_size.max(1);
        self
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }
}

/// One row's segment inputs: queries `[1, h, ql, d]` (already scaled) and
/// keys/values `[1, h, kl, d]` with their absolute positions.
struct SegmentBlock<'a> {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    q_start: usize,
    q_end: usize,
    segment: &'a Segment,
    /// Sorted padded positions inside `segment`.
    holes: &'a [usize],
}

impl FusedAttention {
    fn attend_segment(
        &self,
        block: SegmentBlock<'_>,
        slopes: Option<&Tensor>,
        params: &KernelParams,
    ) -> Result<Tensor, AttentionError> {
        let SegmentBlock {
            q,
            k,
            v,
            q_start,
            q_end,
            segment,
            holes,
        } = block;
        let device = q.device();
        let (_, heads, q_len, head_dim) = q.dims4()?;
        let q_pos = Tensor::arange(q_start as f32, q_end as f32, device)?;
        let last_query = q_end - 1;

        let mut m = Tensor::full(MASK_FILL, (1, heads, q_len, 1), device)?;
        let mut l = Tensor::zeros((1, heads, q_len, 1), DType::F32, device)?;
        let mut acc = Tensor::zeros((1, heads, q_len, head_dim), DType::F32, device)?;

        let mut tile_start = segment.start;
        while tile_start < segment.end() {
            let tile_end = (tile_start + self.tile_size).min(segment.end());
            let tile = tile_start..tile_end;
            tile_start = tile_end;

            if params.causal && tile.start > last_query {
                break;
            }
            if let Some(window) = params.sliding_window {
                if tile.start > last_query + window {
                    break;
                }
                if tile.end - 1 + window < q_start {
                    continue;
                }
            }

            let local = tile.start - segment.start;
            let width = tile.end - tile.start;
            let k_tile = k.narrow(2, local, width)?.transpose(2, 3)?.contiguous()?;
            let v_tile = v.narrow(2, local, width)?.contiguous()?;
            let k_pos = Tensor::arange(tile.start as f32, tile.end as f32, device)?;

            let mut scores = q.matmul(&k_tile)?;
            if let Some(cap) = params.softcap {
                let cap = cap as f64;
                scores = ((scores / cap)?.tanh()? * cap)?;
            }
            if let Some(slopes) = slopes {
                scores = scores.broadcast_add(&alibi_from_positions(slopes, &q_pos, &k_pos)?)?;
            }
            let key_valid = valid_positions(&tile, holes, (1, width), device)?;
            if let Some(allowed) = allowed_pairs(&q_pos, &k_pos, key_valid, params)? {
                let shape = scores.shape().clone();
                let fill = Tensor::full(MASK_FILL, &shape, device)?;
                scores = allowed.broadcast_as(&shape)?.where_cond(&scores, &fill)?;
            }
            let scores = scores.maximum(MASK_FILL)?;

            let m_new = m.maximum(&scores.max_keepdim(D::Minus1)?)?;
            let p = scores.broadcast_sub(&m_new)?.exp()?;
            let correction = (&m - &m_new)?.exp()?;
            l = ((&l * &correction)? + p.sum_keepdim(D::Minus1)?)?;
            let p = match params.effective_dropout() {
                Some(rate) => dropout(&p, rate)?,
                None => p,
            };
            acc = (acc.broadcast_mul(&correction)? + p.matmul(&v_tile)?)?;
            m = m_new;
        }

        let context = acc.broadcast_div(&l)?;
        match valid_positions(&(q_start..q_end), holes, (1, 1, q_len, 1), device)? {
            Some(valid) => Ok(context.broadcast_mul(&valid.to_dtype(DType::F32)?)?),
            None => Ok(context),
        }
    }
}

/// `u8` mask of the non-hole positions of `span` in the given shape, or `None`
/// when `span` has no holes.
fn valid_positions(
    span: &Range<usize>,
    holes: &[usize],
    shape: impl Into<Shape>,
    device: &Device,
) -> Result<Option<Tensor>, AttentionError> {
    if !holes.iter().any(|pos| span.contains(pos)) {
        return Ok(None);
    }
    let valid: Vec<u8> = span
        .clone()
        .map(|pos| u8::from(holes.binary_search(&pos).is_err()))
        .collect();
    Ok(Some(Tensor::from_vec(valid, shape, device)?))
}

/// Causal, window and key-validity permissions for one tile as a `u8`
/// `[q, k]` mask, or `None` when every pair is permitted.
fn allowed_pairs(
    q_pos: &Tensor,
    k_pos: &Tensor,
    key_valid: Option<Tensor>,
    params: &KernelParams,
) -> Result<Option<Tensor>, AttentionError> {
    let q_len = q_pos.dim(0)?;
    let k_len = k_pos.dim(0)?;
    let q_col = q_pos.reshape((q_len, 1))?;
    let k_row = k_pos.reshape((1, k_len))?;

    let mut allowed = None;
    if params.causal {
        allowed = Some(k_row.broadcast_le(&q_col)?);
    }
    if let Some(window) = params.sliding_window {
        let distance = q_col.broadcast_sub(&k_row)?.abs()?;
        let limit = Tensor::full(window as f32, (q_len, k_len), q_pos.device())?;
        let in_window = distance.le(&limit)?;
        allowed = Some(match allowed {
            Some(causal) => (causal * in_window)?,
            None => in_window,
        });
    }
    if let Some(valid) = key_valid {
        allowed = Some(match allowed {
            Some(pairs) => pairs.broadcast_mul(&valid)?,
            None => valid,
        });
    }
    Ok(allowed)
}

fn check_descriptor(descriptor: &PackingDescriptor, shape: &QkvShape) -> Result<(), AttentionError> {
    if descriptor.batch() != shape.batch || descriptor.seq_len() != shape.k_len {
        return Err(AttentionError::shape(format!(
            "packing descriptor covers [{}, {}] but keys are [{}, {}]",
            descriptor.batch(),
            descriptor.seq_len(),
            shape.batch,
            shape.k_len
        )));
    }
    Ok(())
}

impl AttentionKernel for FusedAttention {
    fn name(&self) -> &'static str {
        "fused"
    }

    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: MaskInputs<'_>,
        params: &KernelParams,
    ) -> Result<KernelOutput, AttentionError> {
        let shape = validate_qkv(q, k, v)?;
        let MaskInputs::Packed {
            descriptor,
            alibi_slopes,
        } = mask
        else {
            return Err(AttentionError::Unsupported {
                context: "fused attention consumes a packing descriptor, not a dense bias"
                    .to_string(),
            });
        };
        if params.needs_weights {
            return Err(AttentionError::Unsupported {
                context: "fused attention cannot return attention weights".to_string(),
            });
        }
        check_descriptor(descriptor, &shape)?;
        if let Some(slopes) = alibi_slopes {
            if slopes.dims() != [shape.heads] {
                return Err(AttentionError::shape(format!(
                    "alibi slopes {:?} must be [{}]",
                    slopes.dims(),
                    shape.heads
                )));
            }
        }

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::fused init heads={} kv_heads={} head_dim={} tile={} causal={} window={:?}",
                shape.heads,
                shape.kv_heads,
                shape.head_dim,
                self.tile_size,
                params.causal,
                params.sliding_window
            );
        }

        let dtype = q.dtype();
        let device = q.device();
        let offset = shape.query_offset();
        let slopes = alibi_slopes.map(|s| s.to_dtype(DType::F32)).transpose()?;
        let q_work = (q.to_dtype(DType::F32)? * params.softmax_scale)?;
        let k_work = repeat_kv(&k.to_dtype(DType::F32)?, shape.n_rep())?;
        let v_work = repeat_kv(&v.to_dtype(DType::F32)?, shape.n_rep())?;

        let mut rows = Vec::with_capacity(shape.batch);
        for row in 0..shape.batch {
            let q_row = q_work.narrow(0, row, 1)?;
            let k_row = k_work.narrow(0, row, 1)?;
            let v_row = v_work.narrow(0, row, 1)?;

            let mut pieces = Vec::new();
            for segment in descriptor.segments(row) {
                let q_start = segment.start.max(offset);
                let q_end = segment.end();
                if q_start >= q_end {
                    continue;
                }
                let len = q_end - q_start;
                if segment.padding {
                    pieces.push(Tensor::zeros(
                        (1, shape.heads, len, shape.head_dim),
                        DType::F32,
                        device,
                    )?);
                    continue;
                }
                let holes = descriptor.holes(row);
                let block = SegmentBlock {
                    q: q_row.narrow(2, q_start - offset, len)?.contiguous()?,
                    k: k_row.narrow(2, segment.start, segment.len)?,
                    v: v_row.narrow(2, segment.start, segment.len)?,
                    q_start,
                    q_end,
                    segment,
                    holes,
                };
                pieces.push(self.attend_segment(block, slopes.as_ref(), params)?);
            }
            rows.push(Tensor::cat(&pieces, 2)?);
        }

        let context = Tensor::cat(&rows, 0)?.to_dtype(dtype)?;
        Ok(KernelOutput {
            context,
            weights: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Backend;
    use crate::masks::{alibi_slopes, apply_sequence_id, build_alibi_bias, build_causal_mask};
    use crate::packing::build_packing_descriptor;
    use crate::reference::ExactAttention;
    use candle_core::{Device, Result as CandleResult};

    fn qkv(
        batch: usize,
        heads: usize,
        kv_heads: usize,
        q_len: usize,
        k_len: usize,
        device: &Device,
    ) -> CandleResult<(Tensor, Tensor, Tensor)> {
        Ok((
            Tensor::randn(0f32, 1.0, (batch, heads, q_len, 8), device)?,
            Tensor::randn(0f32, 1.0, (batch, kv_heads, k_len, 8), device)?,
            Tensor::randn(0f32, 1.0, (batch, kv_heads, k_len, 8), device)?,
        ))
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    fn fused_backend() -> Backend {
        Backend::Fused {
            version: Default::default(),
        }
    }

    fn reference(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        params: &KernelParams,
    ) -> Result<Tensor, AttentionError> {
        let mask = MaskInputs::Dense {
            bias,
            key_padding_mask: None,
        };
        Ok(ExactAttention::new().compute(q, k, v, mask, params)?.context)
    }

    #[test]
    fn matches_reference_on_unpacked_rows() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = qkv(2, 4, 2, 7, 7, &device)?;
        let params = KernelParams::new(8);
        let descriptor = PackingDescriptor::unpacked(2, 7);
        let mask = MaskInputs::Packed {
            descriptor: &descriptor,
            alibi_slopes: None,
        };
        let fused = FusedAttention::new().with_tile_size(3).compute(&q, &k, &v, mask, &params)?;
        let expected = reference(&q, &k, &v, None, &params)?;
        assert!(max_diff(&fused.context, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn tile_size_does_not_change_the_result() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = qkv(1, 2, 2, 9, 9, &device)?;
        let params = KernelParams {
            causal: false,
            ..KernelParams::new(8)
        };
        let descriptor = PackingDescriptor::unpacked(1, 9);
        let mask = MaskInputs::Packed {
            descriptor: &descriptor,
            alibi_slopes: None,
        };
        let small = FusedAttention::new().with_tile_size(1).compute(&q, &k, &v, mask, &params)?;
        let large = FusedAttention::new().compute(&q, &k, &v, mask, &params)?;
        assert!(max_diff(&small.context, &large.context)? < 1e-5);
        Ok(())
    }

    #[test]
    fn decode_window_and_alibi_match_reference() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = qkv(1, 4, 4, 2, 10, &device)?;
        let params = KernelParams {
            sliding_window: Some(3),
            softcap: Some(5.0),
            ..KernelParams::new(8)
        };
        let slopes = alibi_slopes(4, 8.0, &device)?;
        let descriptor = PackingDescriptor::unpacked(1, 10);
        let mask = MaskInputs::Packed {
            descriptor: &descriptor,
            alibi_slopes: Some(&slopes),
        };
        let fused = FusedAttention::new().with_tile_size(4).compute(&q, &k, &v, mask, &params)?;

        let bias = build_alibi_bias(4, 10, 10, 8.0, &device)?;
        let expected = reference(&q, &k, &v, Some(&bias), &params)?;
        assert!(max_diff(&fused.context, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn packed_segments_match_sequence_id_bias() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = qkv(2, 2, 1, 6, 6, &device)?;
        let sequence_id = Tensor::new(&[[0i64, 0, 0, 1, 1, 2], [0, 0, 0, 0, 0, 0]], &device)?;
        let params = KernelParams::new(8);
        let descriptor =
            build_packing_descriptor(Some(&sequence_id), 6, true, &fused_backend(), None)?
                .expect("sequence ids produce a descriptor");
        let mask = MaskInputs::Packed {
            descriptor: &descriptor,
            alibi_slopes: None,
        };
        let fused = FusedAttention::new().with_tile_size(2).compute(&q, &k, &v, mask, &params)?;

        let causal = build_causal_mask(&device, 1, 1, 6, 6)?;
        let bias = apply_sequence_id(&causal, &sequence_id, None)?;
        let expected = reference(&q, &k, &v, Some(&bias), &params)?;
        assert!(max_diff(&fused.context, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn padding_positions_produce_zeros() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = qkv(1, 2, 2, 4, 4, &device)?;
        let attention_mask = Tensor::new(&[[0u8, 1, 1, 1]], &device)?;
        let descriptor =
            build_packing_descriptor(None, 4, false, &fused_backend(), Some(&attention_mask))?
                .expect("mask produces a descriptor");
        let mask = MaskInputs::Packed {
            descriptor: &descriptor,
            alibi_slopes: None,
        };
        let out = FusedAttention::new().compute(&q, &k, &v, mask, &KernelParams::new(8))?;
        let padded = out.context.narrow(2, 0, 1)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(padded, 0.0);

        // The first real token attends only to itself.
        let first = out.context.narrow(2, 1, 1)?;
        let value = v.narrow(2, 1, 1)?;
        assert!(max_diff(&first, &value)? < 1e-5);
        Ok(())
    }

    #[test]
    fn decode_after_right_padded_prompt_skips_the_hole() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let attention_mask = Tensor::new(&[[1u8, 1, 0, 1, 1], [1, 1, 1, 1, 1]], &device)?;
        let params = KernelParams {
            sliding_window: Some(3),
            ..KernelParams::new(8)
        };
        let slopes = alibi_slopes(2, 8.0, &device)?;
        let bias = build_alibi_bias(2, 5, 5, 8.0, &device)?;
        let descriptor =
            build_packing_descriptor(None, 5, false, &fused_backend(), Some(&attention_mask))?
                .expect("mask produces a descriptor");
        assert_eq!(descriptor.holes(0), &[2]);

        // Prefill over the whole padded prompt, then a two-token decode step.
        for q_len in [5, 2] {
            let (q, k, v) = qkv(2, 2, 2, q_len, 5, &device)?;
            let mask = MaskInputs::Packed {
                descriptor: &descriptor,
                alibi_slopes: Some(&slopes),
            };
            let fused = FusedAttention::new()
                .with_tile_size(2)
                .compute(&q, &k, &v, mask, &params)?
                .context;
            let dense = MaskInputs::Dense {
                bias: Some(&bias),
                key_padding_mask: Some(&attention_mask),
            };
            let expected = ExactAttention::new().compute(&q, &k, &v, dense, &params)?.context;

            let queries = attention_mask
                .narrow(1, 5 - q_len, q_len)?
                .to_dtype(DType::F32)?
                .reshape((2, 1, q_len, 1))?;
            let fused_real = fused.broadcast_mul(&queries)?;
            assert!(max_diff(&fused_real, &expected.broadcast_mul(&queries)?)? < 1e-5);
            // The hole itself produces zeros.
            assert_eq!(max_diff(&fused_real, &fused)?, 0.0);
        }
        Ok(())
    }

    #[test]
    fn weights_and_dense_masks_are_rejected() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = qkv(1, 2, 2, 3, 3, &device)?;
        let descriptor = PackingDescriptor::unpacked(1, 3);
        let params = KernelParams {
            needs_weights: true,
            ..KernelParams::new(8)
        };
        let mask = MaskInputs::Packed {
            descriptor: &descriptor,
            alibi_slopes: None,
        };
        let err = FusedAttention::new().compute(&q, &k, &v, mask, &params).unwrap_err();
        assert!(matches!(err, AttentionError::Unsupported { .. }));

        let dense = MaskInputs::Dense {
            bias: None,
            key_padding_mask: None,
        };
        let err = FusedAttention::new()
            .compute(&q, &k, &v, dense, &KernelParams::new(8))
            .unwrap_err();
        assert!(matches!(err, AttentionError::Unsupported { .. }));
        Ok(())
    }

    #[test]
    fn descriptor_must_cover_keys() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = qkv(1, 2, 2, 3, 3, &device)?;
        let descriptor = PackingDescriptor::unpacked(1, 5);
        let mask = MaskInputs::Packed {
            descriptor: &descriptor,
            alibi_slopes: None,
        };
        let err = FusedAttention::new()
            .compute(&q, &k, &v, mask, &KernelParams::new(8))
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn half_precision_inputs_keep_their_dtype() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = qkv(1, 2, 2, 5, 5, &device)?;
        let descriptor = PackingDescriptor::unpacked(1, 5);
        let mask = MaskInputs::Packed {
            descriptor: &descriptor,
            alibi_slopes: None,
        };
        let params = KernelParams::new(8);
        let full = FusedAttention::new().compute(&q, &k, &v, mask, &params)?.context;
        let half = FusedAttention::new()
            .compute(
                &q.to_dtype(DType::BF16)?,
                &k.to_dtype(DType::BF16)?,
                &v.to_dtype(DType::BF16)?,
                mask,
                &params,
            )?
            .context;
        assert_eq!(half.dtype(), DType::BF16);
        assert!(max_diff(&half.to_dtype(DType::F32)?, &full)? < 5e-2);
        Ok(())
    }
}
