use std::collections::BTreeMap;

use attention::{AttentionConfig, ConfigError};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Configuration of the decoder stack.
///
/// `attn_config` is shared by every layer; `d_model` always comes from the
/// model. `kv_reuse` maps a consumer layer to the layer whose key/values it
/// reuses: non-negative targets are absolute indices, negative targets are
/// relative to the consumer (`-1` is the previous layer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub d_model: usize,
    pub n_layers: usize,
    pub expansion_ratio: usize,
    pub max_seq_len: usize,
    pub attn_config: AttentionConfig,
    pub kv_reuse: BTreeMap<usize, i64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 2048,
            n_layers: 24,
            expansion_ratio: 4,
            max_seq_len: 2048,
            attn_config: AttentionConfig::default(),
            kv_reuse: BTreeMap::new(),
        }
    }
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        for (name, value) in [
            ("d_model", self.d_model),
            ("n_layers", self.n_layers),
            ("expansion_ratio", self.expansion_ratio),
            ("max_seq_len", self.max_seq_len),
        ] {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if let Some(&layer) = self.kv_reuse.keys().find(|&&layer| layer >= self.n_layers) {
            return Err(ModelError::InvalidConfig(format!(
                "kv_reuse names layer {layer} but the model has {} layers",
                self.n_layers
            )));
        }
        self.producers()?;
        for layer in 0..self.n_layers {
            self.attention_config(layer).resolve()?;
        }
        Ok(())
    }

    /// Attention configuration of `layer`.
    pub fn attention_config(&self, layer: usize) -> AttentionConfig {
        AttentionConfig {
            d_model: self.d_model,
            reuse_kv_layer_idx: self.kv_reuse.get(&layer).copied(),
            ..self.attn_config.clone()
        }
    }

    /// Producer layer of every layer, `None` for layers computing their own
    /// key/values. Rejects forward references and chains of reuse.
    pub fn producers(&self) -> Result<Vec<Option<usize>>, ConfigError> {
        let mut producers = vec![None; self.n_layers];
        for (&layer, &target) in &self.kv_reuse {
            producers[layer] = Some(resolve_reuse_target(layer, target)?);
        }
        for (&layer, _) in &self.kv_reuse {
            if let Some(producer) = producers[layer] {
                if producers[producer].is_some() {
                    return Err(ConfigError::ChainedReuse {
                        layer,
                        target: producer,
                    });
                }
            }
        }
        Ok(producers)
    }
}

/// Absolute producer index for `layer` reusing `target`.
pub fn resolve_reuse_target(layer: usize, target: i64) -> Result<usize, ConfigError> {
    let absolute = if target < 0 {
        layer as i64 + target
    } else {
        target
    };
    if absolute < 0 || absolute >= layer as i64 {
        return Err(ConfigError::ForwardReuse { layer, target });
    }
    Ok(absolute as usize)
}
