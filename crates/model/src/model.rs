use attention::masks::{alibi_slopes, apply_sequence_id, build_bias};
use attention::{
    build_packing_descriptor, AttentionConfig, Backend, KeyValue, LayerKvCache, PackingDescriptor,
    PositionEncoding, RopeAdapter,
};
use candle_core::{DType, Device, Tensor};
use embedding::{
    build_rotary, padding_adjusted_positions, RotaryEmbedding, RotaryFormulation, RotaryPositions,
};
use layers::{LayerNorm, NormConfig, PrecisionPolicy};

use crate::{
    block::{DecoderBlock, SharedInputs},
    config::ModelConfig,
    error::ModelError,
};

#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[batch, seq, d_model]` after the final norm.
    pub hidden: Tensor,
    /// One entry per layer when a past cache was supplied. Layers reusing
    /// another layer's key/values hold an empty cache.
    pub present: Option<Vec<LayerKvCache>>,
}

/// Decoder stack over pre-embedded hidden states.
#[derive(Debug)]
pub struct Model {
    config: ModelConfig,
    blocks: Vec<DecoderBlock>,
    final_norm: LayerNorm,
    /// Producer layer of each layer that reuses key/values.
    producers: Vec<Option<usize>>,
    /// Whether a later layer reuses this layer's key/values.
    reused: Vec<bool>,
    rotary: Option<RotaryEmbedding>,
    /// Causal/alibi bias for `max_seq_len`, sliced per call.
    base_bias: Option<Tensor>,
    alibi_slopes: Option<Tensor>,
    device: Device,
    policy: PrecisionPolicy,
    training: bool,
}

impl Model {
    pub fn new(config: ModelConfig, device: &Device, dtype: DType) -> Result<Self, ModelError> {
        config.validate()?;
        let blocks = (0..config.n_layers)
            .map(|index| DecoderBlock::new(index, &config, device, dtype))
            .collect::<Result<Vec<_>, _>>()?;
        let final_norm = LayerNorm::identity(NormConfig::new(config.d_model), device, dtype)?;
        Self::assemble(config, blocks, final_norm, device, dtype)
    }

    /// Rebuilds the model with another attention configuration while keeping
    /// every weight. Head counts and projection widths must still match.
    pub fn with_attn_config(&self, attn_config: AttentionConfig) -> Result<Self, ModelError> {
        let config = ModelConfig {
            attn_config,
            ..self.config.clone()
        };
        config.validate()?;
        let blocks = self
            .blocks
            .iter()
            .map(|block| block.with_config(&config))
            .collect::<Result<Vec<_>, _>>()?;
        Self::assemble(
            config,
            blocks,
            self.final_norm.clone(),
            &self.device,
            self.policy.storage(),
        )
    }

    fn assemble(
        config: ModelConfig,
        blocks: Vec<DecoderBlock>,
        final_norm: LayerNorm,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, ModelError> {
        let producers = config.producers()?;
        let mut reused = vec![false; config.n_layers];
        for producer in producers.iter().flatten() {
            reused[*producer] = true;
        }
        let attention = blocks[0].attention().config().clone();

        let rotary = match attention.position_encoding {
            PositionEncoding::Rotary { formulation, theta } => Some(build_rotary(
                formulation,
                theta,
                config.max_seq_len,
                config.d_model,
                attention.n_heads,
            )?),
            _ => None,
        };
        let base_bias = build_bias(
            &attention.backend,
            attention.n_heads,
            config.max_seq_len,
            attention.uses_alibi(),
            attention.uses_sequence_id,
            true,
            attention.alibi_bias_max().unwrap_or_default(),
            device,
        )?;
        let alibi_slopes = match (attention.backend, attention.alibi_bias_max()) {
            (Backend::Fused { .. }, Some(bias_max)) => {
                Some(alibi_slopes(attention.n_heads, bias_max, device)?)
            }
            _ => None,
        };

        log::info!(
            "model: layers={} d_model={} backend={:?} reuse={:?}",
            config.n_layers,
            config.d_model,
            attention.backend,
            config.kv_reuse
        );
        Ok(Self {
            config,
            blocks,
            final_norm,
            producers,
            reused,
            rotary,
            base_bias,
            alibi_slopes,
            device: device.clone(),
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            training: false,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[DecoderBlock] {
        &self.blocks
    }

    /// Enables attention dropout.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// An empty cache for every layer, the starting point of generation.
    pub fn empty_cache(&self) -> Vec<LayerKvCache> {
        vec![LayerKvCache::empty(); self.blocks.len()]
    }

    /// Runs the stack over `hidden` (`[batch, seq, d_model]`).
    ///
    /// `attention_mask` and `sequence_id` are `[batch, past + seq]`, covering
    /// cached positions as well as the new ones. Passing `past` (for example
    /// [`Model::empty_cache`]) returns the updated caches.
    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        sequence_id: Option<&Tensor>,
        past: Option<Vec<LayerKvCache>>,
    ) -> Result<ModelOutput, ModelError> {
        let (batch, q_len, width) = hidden.dims3()?;
        if width != self.config.d_model {
            return Err(ModelError::InvalidConfig(format!(
                "hidden width {width} does not match d_model {}",
                self.config.d_model
            )));
        }
        if let Some(past) = &past {
            if past.len() != self.blocks.len() {
                return Err(ModelError::InvalidConfig(format!(
                    "{} past caches supplied for {} layers",
                    past.len(),
                    self.blocks.len()
                )));
            }
        }
        // Layer 0 never reuses, so its cache length is the context length.
        let past_len = past
            .as_ref()
            .and_then(|caches| caches.first())
            .map(LayerKvCache::len)
            .unwrap_or(0);
        let k_len = past_len + q_len;
        if k_len > self.config.max_seq_len {
            return Err(ModelError::SequenceTooLong {
                len: k_len,
                max: self.config.max_seq_len,
            });
        }
        for (name, tensor) in [("attention_mask", attention_mask), ("sequence_id", sequence_id)] {
            if let Some(tensor) = tensor {
                if tensor.dims() != [batch, k_len] {
                    return Err(ModelError::InvalidConfig(format!(
                        "{name} {:?} must be [{batch}, {k_len}]",
                        tensor.dims()
                    )));
                }
            }
        }

        let attention = self.blocks[0].attention().config();
        let sequence_id = sequence_id.filter(|_| attention.uses_sequence_id);
        let attn_bias = match (&self.base_bias, sequence_id) {
            (Some(bias), Some(ids)) => Some(apply_sequence_id(bias, ids, attention_mask)?),
            (Some(bias), None) => Some(bias.clone()),
            (None, _) => None,
        };
        let packing = match build_packing_descriptor(
            sequence_id,
            k_len,
            attention.uses_sequence_id,
            &attention.backend,
            attention_mask,
        )? {
            None if attention.backend.is_fused() => Some(PackingDescriptor::unpacked(batch, k_len)),
            packing => packing,
        };

        // Explicit-position rotary skips padding; the offset form counts it.
        let positions = match (attention.position_encoding, attention_mask) {
            (
                PositionEncoding::Rotary {
                    formulation: RotaryFormulation::Hf { .. },
                    ..
                },
                Some(mask),
            ) => RotaryPositions::Ids(
                padding_adjusted_positions(mask, 0)?.narrow(1, past_len, q_len)?,
            ),
            _ => RotaryPositions::Offset(past_len),
        };
        let adapter = self
            .rotary
            .as_ref()
            .map(|rotary| RopeAdapter::new(rotary, positions));

        let shared = SharedInputs {
            attn_bias: attn_bias.as_ref(),
            attention_mask,
            rotary: adapter.as_ref(),
            packing: packing.as_ref(),
            alibi_slopes: self.alibi_slopes.as_ref(),
            training: self.training,
        };

        let caching = past.is_some();
        let mut past = past;
        let mut produced: Vec<Option<KeyValue>> = vec![None; self.blocks.len()];
        let mut present = Vec::with_capacity(self.blocks.len());
        let mut hidden = hidden.clone();
        for (index, block) in self.blocks.iter().enumerate() {
            let layer_past = match past.as_mut() {
                Some(caches) => Some(std::mem::take(&mut caches[index])),
                // Producers need their key/values even when not caching.
                None if self.reused[index] => Some(LayerKvCache::empty()),
                None => None,
            };
            let borrowed = match self.producers[index] {
                Some(producer) => Some(produced[producer].as_ref().ok_or_else(|| {
                    ModelError::InvalidConfig(format!(
                        "layer {index} reuses layer {producer} which produced no key/values"
                    ))
                })?),
                None => None,
            };

            let (next, key_value) = block.forward(&hidden, &shared, layer_past, borrowed)?;
            hidden = next;
            if caching {
                present.push(key_value.clone().map(LayerKvCache::from).unwrap_or_default());
            }
            if self.reused[index] {
                produced[index] = key_value;
            }
        }

        let hidden = self.final_norm.forward(&hidden, &self.policy)?;
        Ok(ModelOutput {
            hidden,
            present: caching.then_some(present),
        })
    }
}
