//! Core traits and types shared across attention kernels.
//!
//! Kernels receive queries shaped `[batch, n_heads, q_len, head_dim]` and
//! keys/values shaped `[batch, kv_heads, k_len, head_dim]` with
//! `n_heads % kv_heads == 0`; each group of `n_heads / kv_heads` query heads
//! shares one key/value head. Queries are aligned with the most recent
//! `q_len` keys, so `k_len > q_len` during cached decoding. The context
//! mirrors the query layout and dtype; scores and softmax run in `f32`.

pub mod config;
pub mod errors;

use candle_core::{DType, Tensor};

use crate::packing::PackingDescriptor;

pub use config::{
    check_capabilities, validate_kv_heads, AttentionConfig, AttentionType, Backend,
    KernelVersion, PositionEncoding, QkNorm, ResolvedAttentionConfig, RopeDailConfig,
    RopeHfConfig,
};
pub use errors::{AttentionError, ConfigError};

/// Masking metadata in the form the selected kernel consumes.
#[derive(Debug, Clone, Copy)]
pub enum MaskInputs<'a> {
    /// Dense additive bias plus an optional `[batch, k_len]` key-padding mask.
    Dense {
        bias: Option<&'a Tensor>,
        key_padding_mask: Option<&'a Tensor>,
    },
    /// Segment layout plus optional per-head alibi slopes.
    Packed {
        descriptor: &'a PackingDescriptor,
        alibi_slopes: Option<&'a Tensor>,
    },
}

/// Per-call scalar knobs shared by every kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelParams {
    pub causal: bool,
    pub dropout_p: f32,
    pub softmax_scale: f64,
    pub sliding_window: Option<usize>,
    pub softcap: Option<f32>,
    pub training: bool,
    pub needs_weights: bool,
}

impl KernelParams {
    pub fn new(head_dim: usize) -> Self {
        Self {
            causal: true,
            dropout_p: 0.0,
            softmax_scale: 1.0 / (head_dim as f64).sqrt(),
            sliding_window: None,
            softcap: None,
            training: false,
            needs_weights: false,
        }
    }

    pub(crate) fn effective_dropout(&self) -> Option<f32> {
        (self.training && self.dropout_p > 0.0).then_some(self.dropout_p)
    }
}

#[derive(Debug, Clone)]
pub struct KernelOutput {
    /// `[batch, n_heads, q_len, head_dim]`.
    pub context: Tensor,
    /// `[batch, n_heads, q_len, k_len]` when requested.
    pub weights: Option<Tensor>,
}

/// Unified interface for attention kernels.
pub trait AttentionKernel: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: MaskInputs<'_>,
        params: &KernelParams,
    ) -> Result<KernelOutput, AttentionError>;
}

/// Validated shape of one kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QkvShape {
    pub batch: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub head_dim: usize,
}

impl QkvShape {
    pub fn n_rep(&self) -> usize {
        self.heads / self.kv_heads
    }

    /// Absolute position of the first query within the key sequence.
    pub fn query_offset(&self) -> usize {
        self.k_len - self.q_len
    }
}

/// Checks device, dtype and grouped layout agreement of `q`, `k`, `v`.
pub(crate) fn validate_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<QkvShape, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape("q, k, v must reside on the same device"));
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape("q, k, v must share the same dtype"));
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let (batch, heads, q_len, head_dim) = q
        .dims4()
        .map_err(|_| AttentionError::shape("q must have shape [batch, heads, q_len, head_dim]"))?;
    let (kb, kv_heads, k_len, kd) = k
        .dims4()
        .map_err(|_| AttentionError::shape("k must have shape [batch, kv_heads, k_len, head_dim]"))?;
    if v.dims() != k.dims() {
        return Err(AttentionError::shape(format!(
            "v shape {:?} must match k shape {:?}",
            v.dims(),
            k.dims()
        )));
    }
    if kb != batch || kd != head_dim {
        return Err(AttentionError::shape(format!(
            "k shape mismatch: expected [{batch}, ?, ?, {head_dim}] got [{kb}, {kv_heads}, {k_len}, {kd}]"
        )));
    }
    if kv_heads == 0 || heads % kv_heads != 0 {
        return Err(AttentionError::shape(format!(
            "{heads} query heads cannot be grouped over {kv_heads} kv heads"
        )));
    }
    if k_len < q_len {
        return Err(AttentionError::shape(format!(
            "key length {k_len} is shorter than query length {q_len}"
        )));
    }
    Ok(QkvShape {
        batch,
        heads,
        kv_heads,
        q_len,
        k_len,
        head_dim,
    })
}

/// Repeats each kv head `n_rep` times: `[b, kv, s, d] -> [b, kv * n_rep, s, d]`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> candle_core::Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, kv_heads, seq_len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((batch, kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, kv_heads * n_rep, seq_len, head_dim))
}

/// Returns the kernel implementing `backend`.
pub fn kernel_for(backend: &Backend) -> Box<dyn AttentionKernel> {
    match backend {
        Backend::Reference => Box::new(crate::reference::ExactAttention::new()),
        Backend::Fused { .. } => Box::new(crate::fused::FusedAttention::new()),
    }
}
