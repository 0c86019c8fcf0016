//! Rotary positional embeddings.
//!
//! Two interchangeable numeric formulations share one rotation kernel:
//!
//! * [`RotaryFormulation::Dail`] is driven by a scalar offset (`offset..offset + seq`)
//!   and supports the xpos length-extrapolation scale and interleaved pairing.
//! * [`RotaryFormulation::Hf`] is driven by explicit `[batch, seq]` position ids,
//!   so left-padded rows can rotate their first real token by angle zero, and
//!   supports linear and dynamic-NTK frequency scaling.
//!
//! `Dail { Original, interleaved: false }` and `Hf { None }` produce identical
//! rotations for identical positions. Query/key tensors are laid out
//! `[batch, heads, seq, head_dim]`; queries and keys may carry different head
//! counts (grouped-query attention) and are rotated independently.

use candle_core::{bail, DType, Device, Result, Tensor};

use super::cache::{get_sin_cos, TableSpec};
use super::positions::offset_positions;

/// Pairing and scaling of the scalar-offset formulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DailKind {
    Original,
    /// Queries scaled by `ζ^p`, keys by `ζ^-p`, with `p` centred on half the context.
    Xpos { scale_base: f64 },
}

/// Frequency scaling of the explicit-position formulation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum HfScaling {
    #[default]
    None,
    /// Positions divided by `factor`.
    Linear { factor: f64 },
    /// Base θ stretched once positions exceed the configured context.
    Dynamic { factor: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RotaryFormulation {
    Dail { kind: DailKind, interleaved: bool },
    Hf { scaling: HfScaling },
}

impl Default for RotaryFormulation {
    fn default() -> Self {
        RotaryFormulation::Dail {
            kind: DailKind::Original,
            interleaved: false,
        }
    }
}

/// Whether a tensor holds queries or keys; only xpos treats them differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotaryRole {
    Query,
    Key,
}

/// Positions of the tokens being rotated.
#[derive(Debug, Clone)]
pub enum RotaryPositions {
    /// Every row uses `offset..offset + seq`.
    Offset(usize),
    /// Explicit `[batch, seq]` (or `[1, seq]`) integer ids.
    Ids(Tensor),
}

/// Configuration for building rotary positional embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryConfig {
    /// Per-head dimensionality of the representations being rotated.
    pub head_dim: usize,
    /// Leading features to rotate; `None` rotates the full head.
    pub rotary_dim: Option<usize>,
    /// Base angle parameter θ (defaults to 10k).
    pub theta: f64,
    /// Context length the tables are sized for; also the dynamic-NTK threshold.
    pub max_seq_len: usize,
    pub formulation: RotaryFormulation,
}

impl RotaryConfig {
    pub fn new(head_dim: usize, max_seq_len: usize) -> Self {
        Self {
            head_dim,
            rotary_dim: None,
            theta: 10_000.0,
            max_seq_len,
            formulation: RotaryFormulation::default(),
        }
    }

    pub fn with_formulation(mut self, formulation: RotaryFormulation) -> Self {
        self.formulation = formulation;
        self
    }

    pub fn with_theta(mut self, theta: f64) -> Self {
        self.theta = theta;
        self
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim.unwrap_or(self.head_dim)
    }
}

/// Builds the rotary state for a model of `model_width` split over `num_heads`.
pub fn build_rotary(
    formulation: RotaryFormulation,
    theta: f64,
    max_seq_len: usize,
    model_width: usize,
    num_heads: usize,
) -> Result<RotaryEmbedding> {
    if num_heads == 0 || model_width % num_heads != 0 {
        bail!(
            "model width {} is not divisible by {} heads",
            model_width,
            num_heads
        );
    }
    let config = RotaryConfig::new(model_width / num_heads, max_seq_len)
        .with_theta(theta)
        .with_formulation(formulation);
    RotaryEmbedding::new(config)
}

/// Immutable rotary state shared by every attention layer of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryEmbedding {
    config: RotaryConfig,
}

impl RotaryEmbedding {
    pub fn new(config: RotaryConfig) -> Result<Self> {
        if config.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        if config.max_seq_len == 0 {
            bail!("max_seq_len must be non-zero");
        }
        let rotary_dim = config.rotary_dim();
        if rotary_dim < 2 || rotary_dim > config.head_dim || rotary_dim % 2 != 0 {
            bail!(
                "invalid rotary_dim {} for head_dim {}",
                rotary_dim,
                config.head_dim
            );
        }
        match config.formulation {
            RotaryFormulation::Dail {
                kind: DailKind::Xpos { scale_base },
                ..
            } if scale_base <= 0.0 => bail!("xpos scale_base must be positive"),
            RotaryFormulation::Hf {
                scaling: HfScaling::Linear { factor } | HfScaling::Dynamic { factor },
            } if factor < 1.0 => bail!("rope scaling factor must be >= 1, got {factor}"),
            _ => {}
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &RotaryConfig {
        &self.config
    }

    /// Rotates a query or key tensor shaped `[batch, heads, seq, head_dim]`.
    ///
    /// Only the leading `rotary_dim` features are rotated; the tail passes
    /// through untouched. Rotation runs in f32 and the output keeps the input
    /// dtype.
    pub fn rotate(
        &self,
        x: &Tensor,
        positions: &RotaryPositions,
        role: RotaryRole,
    ) -> Result<Tensor> {
        let (batch, heads, seq_len, head_dim) = x.dims4()?;
        if head_dim != self.config.head_dim {
            bail!(
                "rotary head_dim {} does not match tensor head_dim {}",
                self.config.head_dim,
                head_dim
            );
        }
        let rotary_dim = self.config.rotary_dim();
        let half = rotary_dim / 2;

        let (mut sin, mut cos) = self.angles(seq_len, positions, x.device())?;
        if let Some(scale) = self.xpos_scale(seq_len, positions, x.device())? {
            let scale = match role {
                RotaryRole::Query => scale,
                RotaryRole::Key => scale.recip()?,
            };
            sin = sin.broadcast_mul(&scale)?;
            cos = cos.broadcast_mul(&scale)?;
        }
        let rows = sin.dim(0)?;
        if rows != 1 && rows != batch {
            bail!("position ids batch {} does not match tensor batch {}", rows, batch);
        }
        let sin = sin.broadcast_as((batch, heads, seq_len, half))?;
        let cos = cos.broadcast_as((batch, heads, seq_len, half))?;

        let dtype = x.dtype();
        let main = x.narrow(3, 0, rotary_dim)?.to_dtype(DType::F32)?;
        let rotated = if self.interleaved() {
            rotate_interleaved(&main, &sin, &cos)?
        } else {
            rotate_half(&main, &sin, &cos)?
        }
        .to_dtype(dtype)?;

        let tail_dim = head_dim - rotary_dim;
        if tail_dim == 0 {
            Ok(rotated)
        } else {
            let tail = x.narrow(3, rotary_dim, tail_dim)?;
            Tensor::cat(&[&rotated, &tail], 3)
        }
    }

    /// Rotates queries and keys at the same positions.
    pub fn apply_rotary_embeddings(
        &self,
        query: &Tensor,
        key: &Tensor,
        positions: &RotaryPositions,
    ) -> Result<(Tensor, Tensor)> {
        if !query.device().same_device(key.device()) {
            bail!("query and key must live on the same device");
        }
        let q = self.rotate(query, positions, RotaryRole::Query)?;
        let k = self.rotate(key, positions, RotaryRole::Key)?;
        Ok((q, k))
    }

    fn interleaved(&self) -> bool {
        matches!(
            self.config.formulation,
            RotaryFormulation::Dail {
                interleaved: true,
                ..
            }
        )
    }

    fn table_spec(&self, needed_len: usize) -> TableSpec {
        let rotary_dim = self.config.rotary_dim();
        let mut spec = TableSpec::new(rotary_dim, self.config.theta);
        if let RotaryFormulation::Hf { scaling } = self.config.formulation {
            match scaling {
                HfScaling::None => {}
                HfScaling::Linear { factor } => spec.freq_divisor = factor,
                HfScaling::Dynamic { factor } => {
                    let max = self.config.max_seq_len as f64;
                    if needed_len as f64 > max {
                        let stretch = factor * needed_len as f64 / max - (factor - 1.0);
                        let exponent = rotary_dim as f64 / (rotary_dim as f64 - 2.0);
                        spec.base = self.config.theta * stretch.powf(exponent);
                    }
                }
            }
        }
        spec
    }

    /// Returns `(sin, cos)` shaped `[rows, 1, seq, rotary_dim / 2]` in f32.
    fn angles(
        &self,
        seq_len: usize,
        positions: &RotaryPositions,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let half = self.config.rotary_dim() / 2;
        match positions {
            RotaryPositions::Offset(offset) => {
                let needed = offset + seq_len;
                let len = needed.max(self.config.max_seq_len);
                let (sin, cos) = get_sin_cos(len, &self.table_spec(needed), device)?;
                let sin = sin.narrow(0, *offset, seq_len)?.reshape((1, 1, seq_len, half))?;
                let cos = cos.narrow(0, *offset, seq_len)?.reshape((1, 1, seq_len, half))?;
                Ok((sin, cos))
            }
            RotaryPositions::Ids(ids) => {
                let (rows, ids_len) = ids.dims2()?;
                if ids_len != seq_len {
                    bail!(
                        "position ids length {} does not match sequence length {}",
                        ids_len,
                        seq_len
                    );
                }
                let ids = ids.to_dtype(DType::U32)?.to_device(device)?;
                let needed = ids.max_all()?.to_vec0::<u32>()? as usize + 1;
                let len = needed.max(self.config.max_seq_len);
                let (sin, cos) = get_sin_cos(len, &self.table_spec(needed), device)?;
                let flat = ids.flatten_all()?;
                let sin = sin.index_select(&flat, 0)?.reshape((rows, 1, seq_len, half))?;
                let cos = cos.index_select(&flat, 0)?.reshape((rows, 1, seq_len, half))?;
                Ok((sin, cos))
            }
        }
    }

    /// `ζ_i^((p - max_seq_len / 2) / scale_base)` with
    /// `ζ_i = (2i + 0.4 d) / (1.4 d)`, or `None` outside xpos.
    fn xpos_scale(
        &self,
        seq_len: usize,
        positions: &RotaryPositions,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        let scale_base = match self.config.formulation {
            RotaryFormulation::Dail {
                kind: DailKind::Xpos { scale_base },
                ..
            } => scale_base,
            _ => return Ok(None),
        };
        let rotary_dim = self.config.rotary_dim() as f64;
        let ln_zeta: Vec<f32> = (0..self.config.rotary_dim() / 2)
            .map(|i| ((2.0 * i as f64 + 0.4 * rotary_dim) / (1.4 * rotary_dim)).ln() as f32)
            .collect();
        let ln_zeta = Tensor::from_vec(ln_zeta, (1, 1, 1, self.config.rotary_dim() / 2), device)?;

        let positions = match positions {
            RotaryPositions::Offset(offset) => offset_positions(1, seq_len, *offset, device)?,
            RotaryPositions::Ids(ids) => ids.to_device(device)?,
        }
        .to_dtype(DType::F32)?;
        let centre = (self.config.max_seq_len / 2) as f64;
        let power = positions
            .affine(1.0 / scale_base, -centre / scale_base)?
            .unsqueeze(1)?
            .unsqueeze(3)?;
        Ok(Some(power.broadcast_mul(&ln_zeta)?.exp()?))
    }
}

fn rotate_half(x: &Tensor, sin: &Tensor, cos: &Tensor) -> Result<Tensor> {
    let half = x.dim(3)? / 2;
    let x1 = x.narrow(3, 0, half)?;
    let x2 = x.narrow(3, half, half)?;
    let first = x1.mul(cos)?.sub(&x2.mul(sin)?)?;
    let second = x2.mul(cos)?.add(&x1.mul(sin)?)?;
    Tensor::cat(&[&first, &second], 3)
}

fn rotate_interleaved(x: &Tensor, sin: &Tensor, cos: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq_len, rotary_dim) = x.dims4()?;
    let half = rotary_dim / 2;
    let pairs = x.reshape((batch, heads, seq_len, half, 2))?;
    let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
    let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;

    let rotated_even = even.mul(cos)?.sub(&odd.mul(sin)?)?.unsqueeze(4)?;
    let rotated_odd = odd.mul(cos)?.add(&even.mul(sin)?)?.unsqueeze(4)?;
    Tensor::cat(&[&rotated_even, &rotated_odd], 4)?.reshape((batch, heads, seq_len, rotary_dim))
}
