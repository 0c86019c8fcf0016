//! Grouped-query self-attention layer.
//!
//! Covers multi-head (`kv_heads == heads`), multi-query (`kv_heads == 1`) and
//! grouped-query attention. One forward call runs
//! project → clip → qk-norm → rotate → (cache update) → kernel → output
//! projection, in that fixed order for every backend.
//!
//! A layer configured with `reuse_kv_layer_idx` owns only a query projection
//! and attends over the key/values its producer layer returned for the same
//! forward pass.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use layers::{LayerNorm, Linear, LinearConfig, LinearInit, NormConfig, PrecisionPolicy};

use crate::core::{
    kernel_for, AttentionConfig, AttentionError, AttentionKernel, AttentionType, Backend,
    KernelOutput, KernelParams, MaskInputs, PositionEncoding, QkNorm, ResolvedAttentionConfig,
};
use crate::interop::RopeAdapter;
use crate::kv_cache::{CacheLayout, KeyValue, LayerKvCache};
use crate::masks::{alibi_slopes, build_alibi_bias};
use crate::packing::{build_packing_descriptor, PackingDescriptor};

/// Input projection of an attention layer.
#[derive(Debug, Clone)]
pub enum Projection {
    /// `Wqkv`: `d_model -> d_model + 2 * kv_heads * head_dim`, laid out q, k, v.
    Fused(Linear),
    /// `Wq`: `d_model -> d_model`, for layers reusing another layer's keys.
    QueryOnly(Linear),
}

impl Projection {
    pub fn linear(&self) -> &Linear {
        match self {
            Projection::Fused(linear) | Projection::QueryOnly(linear) => linear,
        }
    }
}

/// Every parameter of an attention layer.
#[derive(Debug, Clone)]
pub struct AttentionParams {
    pub projection: Projection,
    pub q_norm: Option<LayerNorm>,
    pub k_norm: Option<LayerNorm>,
    pub out_proj: Linear,
}

impl AttentionParams {
    /// Randomly initialised parameters shaped for `config`.
    pub fn init(
        config: &ResolvedAttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let init = LinearInit::XavierUniform;
        let d_model = config.d_model;
        let projection = if config.reuses_kv() {
            let wq = LinearConfig::new(d_model, d_model).with_bias(config.bias);
            Projection::QueryOnly(Linear::with_init(wq, &init, device, dtype)?)
        } else {
            let wqkv =
                LinearConfig::new(d_model, d_model + 2 * config.kv_width()).with_bias(config.bias);
            Projection::Fused(Linear::with_init(wqkv, &init, device, dtype)?)
        };

        let (q_norm, k_norm) = match norm_widths(config) {
            Some((q_width, k_width)) => {
                let q_norm = LayerNorm::identity(NormConfig::new(q_width), device, dtype)?;
                let k_norm = if config.reuses_kv() {
                    None
                } else {
                    Some(LayerNorm::identity(NormConfig::new(k_width), device, dtype)?)
                };
                (Some(q_norm), k_norm)
            }
            None => (None, None),
        };

        let out = LinearConfig::new(d_model, d_model).with_bias(config.bias);
        let out_proj = Linear::with_init(out, &init, device, dtype)?;
        Ok(Self {
            projection,
            q_norm,
            k_norm,
            out_proj,
        })
    }

    fn validate(&self, config: &ResolvedAttentionConfig) -> Result<(), AttentionError> {
        let d_model = config.d_model;
        let (linear, expected_out) = match (&self.projection, config.reuses_kv()) {
            (Projection::Fused(linear), false) => (linear, d_model + 2 * config.kv_width()),
            (Projection::QueryOnly(linear), true) => (linear, d_model),
            (Projection::Fused(_), true) => {
                return Err(AttentionError::shape(
                    "a layer reusing key/values must only carry a query projection",
                ))
            }
            (Projection::QueryOnly(_), false) => {
                return Err(AttentionError::shape(
                    "a layer computing its own key/values needs a fused Wqkv projection",
                ))
            }
        };
        let projection = linear.config();
        if projection.input_dim != d_model || projection.output_dim != expected_out {
            return Err(AttentionError::shape(format!(
                "input projection is {}x{}, expected {}x{}",
                projection.input_dim, projection.output_dim, d_model, expected_out
            )));
        }
        let out = self.out_proj.config();
        if out.input_dim != d_model || out.output_dim != d_model {
            return Err(AttentionError::shape(format!(
                "output projection is {}x{}, expected {d_model}x{d_model}",
                out.input_dim, out.output_dim
            )));
        }

        let widths = norm_widths(config);
        let check = |name: &str, norm: Option<&LayerNorm>, width: Option<usize>| {
            match (norm, width) {
                (Some(norm), Some(width)) if norm.config().hidden_size == width => Ok(()),
                (None, None) => Ok(()),
                (norm, width) => Err(AttentionError::shape(format!(
                    "{name} norm over {:?} features, expected {:?}",
                    norm.map(|n| n.config().hidden_size),
                    width
                ))),
            }
        };
        check("query", self.q_norm.as_ref(), widths.map(|(q, _)| q))?;
        let k_width = if config.reuses_kv() {
            None
        } else {
            widths.map(|(_, k)| k)
        };
        check("key", self.k_norm.as_ref(), k_width)
    }
}

/// Feature counts the query and key norms run over, if any.
fn norm_widths(config: &ResolvedAttentionConfig) -> Option<(usize, usize)> {
    match config.qk_norm {
        QkNorm::None => None,
        QkNorm::Layer => Some((config.d_model, config.kv_width())),
        QkNorm::Group => Some((config.head_dim, config.head_dim)),
    }
}

/// Per-call inputs of [`GroupedQueryAttention::forward`].
#[derive(Debug, Clone)]
pub struct AttentionInputs<'a> {
    /// `[batch, seq, d_model]`.
    pub hidden: &'a Tensor,
    /// `Some(LayerKvCache::empty())` starts a fresh cache; `None` disables caching.
    pub past: Option<LayerKvCache>,
    /// Dense additive bias for the reference backend, typically built for the
    /// full context and sliced to its trailing window here. It replaces the
    /// generated alibi bias, so an alibi layer's bias must already carry the
    /// alibi term, as [`crate::masks::build_bias`] produces.
    pub attn_bias: Option<&'a Tensor>,
    /// `[batch, k_len]`, non-zero for real tokens.
    pub attention_mask: Option<&'a Tensor>,
    pub rotary: Option<&'a RopeAdapter<'a>>,
    pub is_causal: bool,
    /// Segment layout for the fused backend. Required when sequence-id
    /// masking is enabled; otherwise derived from `attention_mask`.
    pub packing: Option<&'a PackingDescriptor>,
    /// Precomputed `[heads]` alibi slopes for the fused backend.
    pub alibi_slopes: Option<&'a Tensor>,
    /// Key/values returned by the producer layer of a reusing layer.
    pub prev_layer_key_value: Option<&'a KeyValue>,
    pub needs_weights: bool,
    pub training: bool,
}

impl<'a> AttentionInputs<'a> {
    pub fn new(hidden: &'a Tensor) -> Self {
        Self {
            hidden,
            past: None,
            attn_bias: None,
            attention_mask: None,
            rotary: None,
            is_causal: true,
            packing: None,
            alibi_slopes: None,
            prev_layer_key_value: None,
            needs_weights: false,
            training: false,
        }
    }

    pub fn with_past(mut self, past: LayerKvCache) -> Self {
        self.past = Some(past);
        self
    }

    /// See [`AttentionInputs::attn_bias`] for alibi layers.
    pub fn with_bias(mut self, bias: &'a Tensor) -> Self {
        self.attn_bias = Some(bias);
        self
    }

    pub fn with_attention_mask(mut self, mask: &'a Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    pub fn with_rotary(mut self, rotary: &'a RopeAdapter<'a>) -> Self {
        self.rotary = Some(rotary);
        self
    }

    pub fn with_causal(mut self, is_causal: bool) -> Self {
        self.is_causal = is_causal;
        self
    }

    pub fn with_packing(mut self, descriptor: &'a PackingDescriptor) -> Self {
        self.packing = Some(descriptor);
        self
    }

    pub fn with_alibi_slopes(mut self, slopes: &'a Tensor) -> Self {
        self.alibi_slopes = Some(slopes);
        self
    }

    pub fn with_prev_layer_key_value(mut self, key_value: &'a KeyValue) -> Self {
        self.prev_layer_key_value = Some(key_value);
        self
    }

    pub fn with_weights(mut self) -> Self {
        self.needs_weights = true;
        self
    }

    pub fn with_training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch, seq, d_model]`.
    pub output: Tensor,
    /// `[batch, heads, q_len, k_len]` when requested.
    pub weights: Option<Tensor>,
    /// Updated cache when a past cache was supplied. Reusing layers never
    /// return one.
    pub present: Option<KeyValue>,
}

/// Self-attention with `n_heads` query heads grouped over `kv_heads` key/value heads.
#[derive(Debug)]
pub struct GroupedQueryAttention {
    config: ResolvedAttentionConfig,
    params: AttentionParams,
    kernel: Box<dyn AttentionKernel>,
    layout: CacheLayout,
    logged: OnceLock<()>,
}

impl GroupedQueryAttention {
    /// Builds a layer with freshly initialised parameters.
    pub fn new(
        config: &AttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let resolved = config.resolve()?;
        let params = AttentionParams::init(&resolved, device, dtype)?;
        Self::from_resolved(resolved, params)
    }

    /// Multi-head attention regardless of `attn_type`.
    pub fn multihead(
        config: &AttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let config = AttentionConfig {
            attn_type: "multihead_attention".to_string(),
            ..config.clone()
        };
        Self::new(&config, device, dtype)
    }

    /// Multi-query attention (a single key/value head) regardless of `attn_type`.
    pub fn multiquery(
        config: &AttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let config = AttentionConfig {
            attn_type: "multiquery_attention".to_string(),
            ..config.clone()
        };
        Self::new(&config, device, dtype)
    }

    /// Wraps existing parameters, e.g. shared between backends under test.
    pub fn from_params(
        config: &AttentionConfig,
        params: AttentionParams,
    ) -> Result<Self, AttentionError> {
        Self::from_resolved(config.resolve()?, params)
    }

    fn from_resolved(
        config: ResolvedAttentionConfig,
        params: AttentionParams,
    ) -> Result<Self, AttentionError> {
        params.validate(&config)?;
        let kernel = kernel_for(&config.backend);
        let layout = CacheLayout::new(config.kv_heads, config.head_dim);
        Ok(Self {
            config,
            params,
            kernel,
            layout,
            logged: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &ResolvedAttentionConfig {
        &self.config
    }

    pub fn params(&self) -> &AttentionParams {
        &self.params
    }

    pub fn cache_layout(&self) -> CacheLayout {
        self.layout
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    fn log_once(&self) {
        if self.logged.set(()).is_ok() {
            let kind = match self.config.attention_type {
                AttentionType::MultiHead => "multihead",
                AttentionType::MultiQuery => "multiquery",
                AttentionType::GroupedQuery => "grouped_query",
            };
            log::info!(
                "attention layer: type={kind} kernel={} d_model={} heads={} kv_heads={} qk_norm={:?} position={:?} window={:?} reuse={:?}",
                self.kernel.name(),
                self.config.d_model,
                self.config.n_heads,
                self.config.kv_heads,
                self.config.qk_norm,
                self.config.position_encoding,
                self.config.sliding_window,
                self.config.reuse_kv_layer_idx
            );
        }
    }

    fn policy(&self) -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(self.params.out_proj.weight().dtype())
    }

    /// `[b, s, heads * head_dim] -> [b, heads, s, head_dim]`.
    fn split_heads(&self, x: &Tensor, heads: usize) -> Result<Tensor, AttentionError> {
        let (batch, seq, _) = x.dims3()?;
        Ok(x.reshape((batch, seq, heads, self.config.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn normalize(
        &self,
        norm: Option<&LayerNorm>,
        x: &Tensor,
        heads: usize,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, AttentionError> {
        let Some(norm) = norm else {
            return Ok(x.clone());
        };
        match self.config.qk_norm {
            QkNorm::None => Ok(x.clone()),
            QkNorm::Layer => Ok(norm.forward(x, policy)?),
            QkNorm::Group => {
                let (batch, seq, width) = x.dims3()?;
                let per_head = x.reshape((batch, seq, heads, self.config.head_dim))?;
                Ok(norm.forward(&per_head, policy)?.reshape((batch, seq, width))?)
            }
        }
    }

    /// Projects, clips and normalises; returns queries and, unless this layer
    /// reuses key/values, keys and values. All per-head `[b, h, s, d]`.
    fn project(
        &self,
        hidden: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<(Tensor, Option<(Tensor, Tensor)>), AttentionError> {
        let clip = |x: Tensor| -> Result<Tensor, AttentionError> {
            match self.config.clip_qkv {
                Some(clip) => Ok(x.clamp(-clip, clip)?),
                None => Ok(x),
            }
        };
        let d_model = self.config.d_model;
        let kv_width = self.config.kv_width();

        let (q, kv) = match &self.params.projection {
            Projection::Fused(wqkv) => {
                let qkv = clip(wqkv.forward(hidden, policy)?)?;
                let q = qkv.narrow(2, 0, d_model)?;
                let k = qkv.narrow(2, d_model, kv_width)?;
                let v = qkv.narrow(2, d_model + kv_width, kv_width)?;
                (q, Some((k, v)))
            }
            Projection::QueryOnly(wq) => (clip(wq.forward(hidden, policy)?)?, None),
        };

        let heads = self.config.n_heads;
        let kv_heads = self.config.kv_heads;
        let q = self.normalize(self.params.q_norm.as_ref(), &q, heads, policy)?;
        let q = self.split_heads(&q, heads)?;
        let kv = match kv {
            Some((k, v)) => {
                let k = self.normalize(self.params.k_norm.as_ref(), &k, kv_heads, policy)?;
                Some((self.split_heads(&k, kv_heads)?, self.split_heads(&v, kv_heads)?))
            }
            None => None,
        };
        Ok((q, kv))
    }

    pub fn forward(&self, inputs: AttentionInputs<'_>) -> Result<AttentionOutput, AttentionError> {
        let hidden = inputs.hidden;
        let (batch, q_len, width) = hidden
            .dims3()
            .map_err(|_| AttentionError::shape("hidden states must be [batch, seq, d_model]"))?;
        if width != self.config.d_model {
            return Err(AttentionError::shape(format!(
                "hidden width {width} does not match d_model {}",
                self.config.d_model
            )));
        }
        self.log_once();
        let policy = self.policy();
        let (q, kv) = self.project(hidden, &policy)?;

        let rotary = match self.config.position_encoding {
            PositionEncoding::Rotary { .. } => Some(inputs.rotary.ok_or_else(|| {
                AttentionError::Unsupported {
                    context: "rotary position encoding configured but no rotary inputs supplied"
                        .to_string(),
                }
            })?),
            _ => None,
        };
        let (q, kv) = match (rotary, kv) {
            (Some(rope), Some((k, v))) => {
                let (q, k) = rope.apply(&q, Some(&k))?;
                (q, k.map(|k| (k, v)))
            }
            (Some(rope), None) => (rope.rotate_query(&q)?, None),
            (None, kv) => (q, kv),
        };

        let (key, value, present) = match (kv, inputs.prev_layer_key_value) {
            (Some(_), Some(_)) => {
                return Err(AttentionError::shape(
                    "layer computes its own key/values; prev_layer_key_value must be absent",
                ))
            }
            (Some((k, v)), None) => match &inputs.past {
                Some(past) => {
                    let entry = past.append(&k, &v, &self.layout)?;
                    (entry.key.clone(), entry.value.clone(), Some(entry))
                }
                None => (k, v, None),
            },
            (None, Some(shared)) => {
                let (shared_batch, _) = shared.validate(&self.layout)?;
                if shared_batch != batch {
                    return Err(AttentionError::shape(format!(
                        "reused key/values have batch {shared_batch}, hidden states have {batch}"
                    )));
                }
                (shared.key.clone(), shared.value.clone(), None)
            }
            (None, None) => {
                return Err(AttentionError::shape(format!(
                    "layer reuses key/values of layer {:?} but none were supplied",
                    self.config.reuse_kv_layer_idx
                )))
            }
        };
        let k_len = key.dim(2)?;
        let device = hidden.device();

        let generated_bias;
        let generated_descriptor;
        let generated_slopes;
        let mask = match self.config.backend {
            Backend::Reference => {
                let bias = match (inputs.attn_bias, self.config.position_encoding) {
                    (Some(bias), _) => Some(bias),
                    (None, PositionEncoding::Alibi { bias_max }) => {
                        generated_bias =
                            build_alibi_bias(self.config.n_heads, q_len, k_len, bias_max, device)?;
                        Some(&generated_bias)
                    }
                    _ => None,
                };
                MaskInputs::Dense {
                    bias,
                    key_padding_mask: inputs.attention_mask,
                }
            }
            Backend::Fused { .. } => {
                let descriptor = match inputs.packing {
                    Some(descriptor) => descriptor,
                    None if self.config.uses_sequence_id => {
                        return Err(AttentionError::Unsupported {
                            context: "sequence-id masking on the fused backend needs a packing \
                                      descriptor built from the sequence ids"
                                .to_string(),
                        })
                    }
                    None => {
                        generated_descriptor = build_packing_descriptor(
                            None,
                            k_len,
                            false,
                            &self.config.backend,
                            inputs.attention_mask,
                        )?
                        .unwrap_or_else(|| PackingDescriptor::unpacked(batch, k_len));
                        &generated_descriptor
                    }
                };
                let alibi_slopes = match (inputs.alibi_slopes, self.config.position_encoding) {
                    (Some(slopes), PositionEncoding::Alibi { .. }) => Some(slopes),
                    (None, PositionEncoding::Alibi { bias_max }) => {
                        generated_slopes = alibi_slopes(self.config.n_heads, bias_max, device)?;
                        Some(&generated_slopes)
                    }
                    _ => None,
                };
                MaskInputs::Packed {
                    descriptor,
                    alibi_slopes,
                }
            }
        };

        let params = KernelParams {
            causal: inputs.is_causal,
            dropout_p: self.config.dropout_p,
            softmax_scale: self.config.softmax_scale,
            sliding_window: self.config.sliding_window,
            softcap: self.config.softcap,
            training: inputs.training,
            needs_weights: inputs.needs_weights,
        };
        let KernelOutput { context, weights } =
            self.kernel.compute(&q, &key, &value, mask, &params)?;

        let context = context
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, self.config.d_model))?;
        let output = self.params.out_proj.forward(&context, &policy)?;
        Ok(AttentionOutput {
            output,
            weights,
            present,
        })
    }
}
