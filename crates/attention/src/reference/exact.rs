//! Reference attention kernel.
//!
//! Order of operations per head: `q·kᵀ * scale`, softcap, additive bias
//! (sliced to its trailing `[q_len, k_len]` window), key padding, causal and
//! sliding-window masking, softmax, dropout, weighted sum of values.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{dropout, softmax};

use crate::core::{
    repeat_kv, validate_qkv, AttentionError, AttentionKernel, KernelOutput, KernelParams,
    MaskInputs, QkvShape,
};
use crate::masks::{
    causal_allowed, key_padding_allowed, trailing_window, window_allowed, MASK_FILL,
};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_bias(bias: &Tensor, shape: &QkvShape) -> Result<(), AttentionError> {
    let (bb, bh, _, _) = bias
        .dims4()
        .map_err(|_| AttentionError::shape("attention bias must be [batch|1, heads|1, q, k]"))?;
    if (bb != 1 && bb != shape.batch) || (bh != 1 && bh != shape.heads) {
        return Err(AttentionError::shape(format!(
            "attention bias {:?} does not broadcast over [{}, {}, ..]",
            bias.dims(),
            shape.batch,
            shape.heads
        )));
    }
    Ok(())
}

impl AttentionKernel for ExactAttention {
    fn name(&self) -> &'static str {
        "reference"
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
        let MaskInputs::Dense {
            bias,
            key_padding_mask,
        } = mask
        else {
            return Err(AttentionError::Unsupported {
                context: "reference attention consumes a dense bias, not a packing descriptor"
                    .to_string(),
            });
        };

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init heads={} kv_heads={} head_dim={} causal={} window={:?} softcap={:?}",
                shape.heads,
                shape.kv_heads,
                shape.head_dim,
                params.causal,
                params.sliding_window,
                params.softcap
            );
        }

        let QkvShape {
            batch,
            heads,
            q_len,
            k_len,
            ..
        } = shape;
        let device = q.device();
        let dtype = q.dtype();
        let full = (batch, heads, q_len, k_len);

        let q_work = q.to_dtype(DType::F32)?.contiguous()?;
        let k_work = repeat_kv(&k.to_dtype(DType::F32)?, shape.n_rep())?;
        let v_work = repeat_kv(&v.to_dtype(DType::F32)?, shape.n_rep())?.contiguous()?;

        let k_t = k_work.transpose(2, 3)?.contiguous()?;
        let mut scores = (q_work.matmul(&k_t)? * params.softmax_scale)?;
        if let Some(cap) = params.softcap {
            let cap = cap as f64;
            scores = ((scores / cap)?.tanh()? * cap)?;
        }

        if let Some(bias) = bias {
            check_bias(bias, &shape)?;
            let bias = trailing_window(bias, q_len, k_len)?.to_dtype(DType::F32)?;
            scores = scores.broadcast_add(&bias)?;
        }

        let fill = Tensor::full(MASK_FILL, full, device)?;
        if let Some(mask) = key_padding_mask {
            if mask.dims() != [batch, k_len] {
                return Err(AttentionError::shape(format!(
                    "attention mask {:?} must be [{batch}, {k_len}]",
                    mask.dims()
                )));
            }
            let allowed = key_padding_allowed(mask)?.broadcast_as(full)?;
            scores = allowed.where_cond(&scores, &fill)?;
        }
        if params.causal {
            let allowed = causal_allowed(device, q_len, k_len)?
                .reshape((1, 1, q_len, k_len))?
                .broadcast_as(full)?;
            scores = allowed.where_cond(&scores, &fill)?;
        }
        if let Some(window) = params.sliding_window {
            let allowed = window_allowed(device, q_len, k_len, window)?
                .reshape((1, 1, q_len, k_len))?
                .broadcast_as(full)?;
            scores = allowed.where_cond(&scores, &fill)?;
        }
        // Overlapping masks can sum past f32::MIN; keep every row finite.
        let scores = scores.maximum(MASK_FILL)?;

        let probs = softmax(&scores, D::Minus1)?;
        let probs = match params.effective_dropout() {
            Some(p) => dropout(&probs, p)?,
            None => probs,
        };

        let context = probs.matmul(&v_work)?.to_dtype(dtype)?;
        let weights = if params.needs_weights {
            Some(probs.to_dtype(dtype)?)
        } else {
            None
        };
        Ok(KernelOutput { context, weights })
    }
}
