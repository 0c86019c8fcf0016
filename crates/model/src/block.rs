use attention::{
    AttentionInputs, GroupedQueryAttention, KeyValue, LayerKvCache, PackingDescriptor, RopeAdapter,
};
use candle_core::{DType, Device, Tensor};
use layers::{FeedForward, FeedForwardConfig, LayerNorm, LinearInit, NormConfig, PrecisionPolicy};

use crate::{config::ModelConfig, error::ModelError};

/// Masking and position state shared by every block of one forward call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedInputs<'a> {
    pub attn_bias: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    pub rotary: Option<&'a RopeAdapter<'a>>,
    pub packing: Option<&'a PackingDescriptor>,
    pub alibi_slopes: Option<&'a Tensor>,
    pub training: bool,
}

/// Pre-norm decoder block: `x + attn(ln(x))`, then `x + ffn(ln(x))`.
#[derive(Debug)]
pub struct DecoderBlock {
    index: usize,
    norm_attn: LayerNorm,
    attention: GroupedQueryAttention,
    norm_ffn: LayerNorm,
    ffn: FeedForward,
    policy: PrecisionPolicy,
}

impl DecoderBlock {
    pub fn new(
        index: usize,
        config: &ModelConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, ModelError> {
        let norm = NormConfig::new(config.d_model);
        let attention = GroupedQueryAttention::new(&config.attention_config(index), device, dtype)?;
        let ffn = FeedForward::with_init(
            FeedForwardConfig::new(config.d_model, config.d_model * config.expansion_ratio),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Ok(Self {
            index,
            norm_attn: LayerNorm::identity(norm.clone(), device, dtype)?,
            attention,
            norm_ffn: LayerNorm::identity(norm, device, dtype)?,
            ffn,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// The same weights under another model configuration, for instance a
    /// different attention backend.
    pub fn with_config(&self, config: &ModelConfig) -> Result<Self, ModelError> {
        let attention = GroupedQueryAttention::from_params(
            &config.attention_config(self.index),
            self.attention.params().clone(),
        )?;
        Ok(Self {
            index: self.index,
            norm_attn: self.norm_attn.clone(),
            attention,
            norm_ffn: self.norm_ffn.clone(),
            ffn: self.ffn.clone(),
            policy: self.policy,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn attention(&self) -> &GroupedQueryAttention {
        &self.attention
    }

    /// Returns the block output and the attention layer's present key/values.
    pub fn forward(
        &self,
        hidden: &Tensor,
        shared: &SharedInputs<'_>,
        past: Option<LayerKvCache>,
        prev_layer_key_value: Option<&KeyValue>,
    ) -> Result<(Tensor, Option<KeyValue>), ModelError> {
        let normed = self.norm_attn.forward(hidden, &self.policy)?;
        let inputs = AttentionInputs {
            past,
            attn_bias: shared.attn_bias,
            attention_mask: shared.attention_mask,
            rotary: shared.rotary,
            packing: shared.packing,
            alibi_slopes: shared.alibi_slopes,
            prev_layer_key_value,
            training: shared.training,
            ..AttentionInputs::new(&normed)
        };
        let attended = self.attention.forward(inputs)?;
        let hidden = (hidden + &attended.output)?;

        let normed = self.norm_ffn.forward(&hidden, &self.policy)?;
        let hidden = (&hidden + self.ffn.forward(&normed, &self.policy)?)?;
        Ok((hidden, attended.present))
    }
}
