//! Configuration surface for attention layers.
//!
//! [`AttentionConfig`] mirrors the serialized knobs a model config carries.
//! It is never consumed directly: [`AttentionConfig::resolve`] validates it
//! eagerly and produces a [`ResolvedAttentionConfig`] with typed selectors,
//! so every configuration or capability problem surfaces at construction
//! time rather than mid-forward.

use std::fmt;
use std::str::FromStr;

use embedding::positional::{DailKind, HfScaling, RotaryFormulation};
use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, ConfigError};

/// Version of the fused attention kernel, compared lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub const DEFAULT: KernelVersion = KernelVersion::new(2, 6, 3);
    pub const SEQUENCE_ID: KernelVersion = KernelVersion::new(2, 1, 2);
    pub const SLIDING_WINDOW: KernelVersion = KernelVersion::new(2, 3, 0);
    pub const ALIBI: KernelVersion = KernelVersion::new(2, 4, 2);
    pub const SOFTCAP: KernelVersion = KernelVersion::new(2, 6, 2);
}

impl Default for KernelVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KernelVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidKernelVersion(s.to_string());
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, ConfigError> {
            match parts.next() {
                Some(part) => part.parse().map_err(|_| invalid()),
                None => Ok(0),
            }
        };
        let version = KernelVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

/// Serialized attention configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub d_model: usize,
    pub n_heads: usize,
    /// `reference` (alias `torch`) or `fused` (alias `flash`).
    pub attn_impl: String,
    /// `multihead_attention`, `multiquery_attention` or `grouped_query_attention`.
    pub attn_type: String,
    pub kv_n_heads: Option<i64>,
    pub clip_qkv: Option<f32>,
    pub qk_ln: bool,
    pub qk_gn: bool,
    /// `-1` disables the window.
    pub sliding_window_size: i64,
    pub attn_uses_sequence_id: bool,
    pub alibi: bool,
    pub alibi_bias_max: f32,
    pub rope: bool,
    pub nope: bool,
    /// `dail` or `hf`.
    pub rope_impl: String,
    pub rope_theta: f64,
    pub rope_dail_config: RopeDailConfig,
    pub rope_hf_config: RopeHfConfig,
    pub reuse_kv_layer_idx: Option<i64>,
    pub attn_logit_softcapping: Option<f32>,
    pub attn_pdrop: f32,
    pub softmax_scale: Option<f64>,
    /// Bias terms on the projections.
    pub bias: bool,
    pub fused_kernel_version: Option<String>,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            d_model: 2048,
            n_heads: 16,
            attn_impl: "reference".to_string(),
            attn_type: "multihead_attention".to_string(),
            kv_n_heads: None,
            clip_qkv: None,
            qk_ln: false,
            qk_gn: false,
            sliding_window_size: -1,
            attn_uses_sequence_id: false,
            alibi: false,
            alibi_bias_max: 8.0,
            rope: false,
            nope: false,
            rope_impl: "dail".to_string(),
            rope_theta: 10_000.0,
            rope_dail_config: RopeDailConfig::default(),
            rope_hf_config: RopeHfConfig::default(),
            reuse_kv_layer_idx: None,
            attn_logit_softcapping: None,
            attn_pdrop: 0.0,
            softmax_scale: None,
            bias: true,
            fused_kernel_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RopeDailConfig {
    /// `original` or `xpos`.
    #[serde(rename = "type")]
    pub kind: String,
    pub xpos_scale_base: f64,
    pub interleaved: bool,
}

impl Default for RopeDailConfig {
    fn default() -> Self {
        Self {
            kind: "original".to_string(),
            xpos_scale_base: 512.0,
            interleaved: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RopeHfConfig {
    /// `no_scaling`, `linear` or `dynamic`.
    #[serde(rename = "type")]
    pub kind: String,
    pub factor: f64,
}

impl Default for RopeHfConfig {
    fn default() -> Self {
        Self {
            kind: "no_scaling".to_string(),
            factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Dense-bias reference kernel; always available.
    Reference,
    /// Tiled online-softmax kernel consuming packing descriptors.
    Fused { version: KernelVersion },
}

impl Backend {
    pub fn is_fused(&self) -> bool {
        matches!(self, Backend::Fused { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionType {
    MultiHead,
    MultiQuery,
    GroupedQuery,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionEncoding {
    None,
    Alibi { bias_max: f32 },
    Rotary { formulation: RotaryFormulation, theta: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkNorm {
    None,
    /// LayerNorm over the full query width and full key width.
    Layer,
    /// LayerNorm over each head's slice.
    Group,
}

/// Validated configuration consumed by attention layers and kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAttentionConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub backend: Backend,
    pub attention_type: AttentionType,
    pub clip_qkv: Option<f32>,
    pub qk_norm: QkNorm,
    pub sliding_window: Option<usize>,
    pub uses_sequence_id: bool,
    pub position_encoding: PositionEncoding,
    pub reuse_kv_layer_idx: Option<i64>,
    pub softcap: Option<f32>,
    pub dropout_p: f32,
    pub softmax_scale: f64,
    pub bias: bool,
}

impl ResolvedAttentionConfig {
    /// Width of the concatenated key (or value) projection.
    pub fn kv_width(&self) -> usize {
        self.kv_heads * self.head_dim
    }

    pub fn uses_alibi(&self) -> bool {
        matches!(self.position_encoding, PositionEncoding::Alibi { .. })
    }

    pub fn alibi_bias_max(&self) -> Option<f32> {
        match self.position_encoding {
            PositionEncoding::Alibi { bias_max } => Some(bias_max),
            _ => None,
        }
    }

    pub fn reuses_kv(&self) -> bool {
        self.reuse_kv_layer_idx.is_some()
    }
}

fn parse_backend(name: &str, version: Option<&str>) -> Result<Backend, ConfigError> {
    match name {
        "reference" | "torch" => Ok(Backend::Reference),
        "fused" | "flash" => {
            let version = match version {
                Some(raw) => raw.parse()?,
                None => KernelVersion::DEFAULT,
            };
            Ok(Backend::Fused { version })
        }
        other => Err(ConfigError::UnknownOption {
            field: "attn_impl",
            value: other.to_string(),
        }),
    }
}

fn parse_attention_type(name: &str) -> Result<AttentionType, ConfigError> {
    match name {
        "multihead_attention" | "multihead" => Ok(AttentionType::MultiHead),
        "multiquery_attention" | "multiquery" => Ok(AttentionType::MultiQuery),
        "grouped_query_attention" | "groupedquery" => Ok(AttentionType::GroupedQuery),
        other => Err(ConfigError::UnknownOption {
            field: "attn_type",
            value: other.to_string(),
        }),
    }
}

/// Validates a kv-head count against the query head count.
pub fn validate_kv_heads(heads: usize, kv_heads: i64) -> Result<usize, ConfigError> {
    if kv_heads <= 0 {
        return Err(ConfigError::InvalidKvHeads {
            kv_heads,
            reason: "must be greater than zero",
        });
    }
    let kv = kv_heads as usize;
    if kv > heads {
        return Err(ConfigError::InvalidKvHeads {
            kv_heads,
            reason: "must be less than or equal to n_heads",
        });
    }
    if heads % kv != 0 {
        return Err(ConfigError::IndivisibleHeads {
            heads,
            kv_heads: kv,
        });
    }
    Ok(kv)
}

impl AttentionConfig {
    /// Layers `ATTN_IMPL`, `ATTN_SLIDING_WINDOW` and `ATTN_FUSED_VERSION` over
    /// the serialized values. Unparseable overrides are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("ATTN_IMPL") {
            self.attn_impl = value.trim().to_string();
        }
        if let Ok(value) = std::env::var("ATTN_SLIDING_WINDOW") {
            match value.trim().parse::<i64>() {
                Ok(window) => self.sliding_window_size = window,
                Err(_) => log::warn!("ignoring invalid ATTN_SLIDING_WINDOW={value}"),
            }
        }
        if let Ok(value) = std::env::var("ATTN_FUSED_VERSION") {
            self.fused_kernel_version = Some(value.trim().to_string());
        }
    }

    fn position_encoding(&self) -> Result<PositionEncoding, ConfigError> {
        if self.alibi && self.rope {
            return Err(ConfigError::ConflictingPositionEncodings(
                "alibi and rope cannot both be enabled",
            ));
        }
        if self.nope && (self.alibi || self.rope) {
            return Err(ConfigError::ConflictingPositionEncodings(
                "nope excludes alibi and rope",
            ));
        }
        if self.alibi {
            if !(self.alibi_bias_max > 0.0) {
                return Err(ConfigError::InvalidPositive {
                    name: "alibi_bias_max",
                    value: self.alibi_bias_max as f64,
                });
            }
            return Ok(PositionEncoding::Alibi {
                bias_max: self.alibi_bias_max,
            });
        }
        if !self.rope {
            return Ok(PositionEncoding::None);
        }
        if !(self.rope_theta > 0.0 && self.rope_theta.is_finite()) {
            return Err(ConfigError::InvalidPositive {
                name: "rope_theta",
                value: self.rope_theta,
            });
        }
        let formulation = match self.rope_impl.as_str() {
            "dail" => {
                let kind = match self.rope_dail_config.kind.as_str() {
                    "original" => DailKind::Original,
                    "xpos" => DailKind::Xpos {
                        scale_base: self.rope_dail_config.xpos_scale_base,
                    },
                    other => {
                        return Err(ConfigError::UnknownOption {
                            field: "rope_dail_config.type",
                            value: other.to_string(),
                        })
                    }
                };
                RotaryFormulation::Dail {
                    kind,
                    interleaved: self.rope_dail_config.interleaved,
                }
            }
            "hf" => {
                let factor = self.rope_hf_config.factor;
                let scaling = match self.rope_hf_config.kind.as_str() {
                    "no_scaling" => HfScaling::None,
                    "linear" => HfScaling::Linear { factor },
                    "dynamic" => HfScaling::Dynamic { factor },
                    other => {
                        return Err(ConfigError::UnknownOption {
                            field: "rope_hf_config.type",
                            value: other.to_string(),
                        })
                    }
                };
                RotaryFormulation::Hf { scaling }
            }
            other => {
                return Err(ConfigError::UnknownOption {
                    field: "rope_impl",
                    value: other.to_string(),
                })
            }
        };
        Ok(PositionEncoding::Rotary {
            formulation,
            theta: self.rope_theta,
        })
    }

    /// Validates the configuration and checks fused-kernel capabilities.
    pub fn resolve(&self) -> Result<ResolvedAttentionConfig, AttentionError> {
        let backend = parse_backend(&self.attn_impl, self.fused_kernel_version.as_deref())?;
        let attention_type = parse_attention_type(&self.attn_type)?;

        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(ConfigError::WidthNotDivisible {
                d_model: self.d_model,
                heads: self.n_heads,
            }
            .into());
        }
        let kv_heads = match attention_type {
            AttentionType::MultiHead => self.n_heads,
            AttentionType::MultiQuery => 1,
            AttentionType::GroupedQuery => {
                let kv = self.kv_n_heads.ok_or(ConfigError::MissingKvHeads)?;
                validate_kv_heads(self.n_heads, kv)?
            }
        };

        if self.qk_ln && self.qk_gn {
            return Err(ConfigError::ConflictingQkNorm.into());
        }
        let qk_norm = match (self.qk_ln, self.qk_gn) {
            (true, _) => QkNorm::Layer,
            (_, true) => QkNorm::Group,
            _ => QkNorm::None,
        };

        let sliding_window = match self.sliding_window_size {
            -1 => None,
            w if w >= 0 => Some(w as usize),
            w => return Err(ConfigError::InvalidSlidingWindow(w).into()),
        };
        if !(0.0..1.0).contains(&self.attn_pdrop) {
            return Err(ConfigError::InvalidDropout(self.attn_pdrop).into());
        }
        for (name, value) in [
            ("clip_qkv", self.clip_qkv),
            ("attn_logit_softcapping", self.attn_logit_softcapping),
        ] {
            if let Some(value) = value {
                if !(value > 0.0 && value.is_finite()) {
                    return Err(ConfigError::InvalidPositive {
                        name,
                        value: value as f64,
                    }
                    .into());
                }
            }
        }
        let head_dim = self.d_model / self.n_heads;
        let softmax_scale = match self.softmax_scale {
            Some(scale) if !(scale > 0.0 && scale.is_finite()) => {
                return Err(ConfigError::InvalidPositive {
                    name: "softmax_scale",
                    value: scale,
                }
                .into())
            }
            Some(scale) => scale,
            None => 1.0 / (head_dim as f64).sqrt(),
        };
        let position_encoding = self.position_encoding()?;

        let resolved = ResolvedAttentionConfig {
            d_model: self.d_model,
            n_heads: self.n_heads,
            kv_heads,
            head_dim,
            backend,
            attention_type,
            clip_qkv: self.clip_qkv,
            qk_norm,
            sliding_window,
            uses_sequence_id: self.attn_uses_sequence_id,
            position_encoding,
            reuse_kv_layer_idx: self.reuse_kv_layer_idx,
            softcap: self.attn_logit_softcapping,
            dropout_p: self.attn_pdrop,
            softmax_scale,
            bias: self.bias,
        };
        check_capabilities(&resolved)?;
        Ok(resolved)
    }
}

/// Rejects features the configured fused kernel version cannot express.
pub fn check_capabilities(config: &ResolvedAttentionConfig) -> Result<(), AttentionError> {
    let Backend::Fused { version } = config.backend else {
        return Ok(());
    };
    let requirements = [
        (config.uses_sequence_id, "sequence-id masking", KernelVersion::SEQUENCE_ID),
        (config.sliding_window.is_some(), "sliding window attention", KernelVersion::SLIDING_WINDOW),
        (config.uses_alibi(), "alibi bias", KernelVersion::ALIBI),
        (config.softcap.is_some(), "logit softcapping", KernelVersion::SOFTCAP),
    ];
    for (requested, feature, required) in requirements {
        if requested && version < required {
            log::warn!(
                "fused kernel {version} cannot provide {feature} (requires {required})"
            );
            return Err(AttentionError::Capability {
                feature,
                required,
                found: version,
            });
        }
    }
    Ok(())
}
