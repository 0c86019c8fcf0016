//! Layer normalisation with unified shape and dtype handling.
//!
//! Normalisation happens along the last axis while preserving the original
//! layout, so the same layer serves `(batch, seq, hidden)` activations and
//! per-head `(batch, seq, heads, head_dim)` query/key normalisation. Mean and
//! variance are computed in [`PrecisionPolicy::reduction`] before casting the
//! output back to storage.

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the trailing dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Whether post-normalisation scale and shift are applied.
    pub elementwise_affine: bool,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            elementwise_affine: true,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// LayerNorm over the trailing dimension built from differentiable tensor ops.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl LayerNorm {
    /// Wraps existing scale and shift parameters.
    pub fn new(config: NormConfig, weight: Option<Tensor>, bias: Option<Tensor>) -> Result<Self> {
        if config.elementwise_affine {
            if weight.is_none() || bias.is_none() {
                return Err(Error::Msg(
                    "elementwise affine norms must supply scale and bias parameters".into(),
                ));
            }
        } else if weight.is_some() || bias.is_some() {
            return Err(Error::Msg(
                "non-affine norms must not include scale or bias parameters".into(),
            ));
        }

        for (name, param) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            if let Some(param) = param {
                checks::expect_shape(name, param, &[config.hidden_size])?;
                checks::expect_dtype_in(name, param, &checks::PARAM_DTYPES)?;
            }
        }

        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Unit scale and zero shift, the usual starting point for training.
    pub fn identity(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let (weight, bias) = if config.elementwise_affine {
            (
                Some(Tensor::ones(config.hidden_size, dtype, device)?),
                Some(Tensor::zeros(config.hidden_size, dtype, device)?),
            )
        } else {
            (None, None)
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;

        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered.broadcast_div(&denom)?;

        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }
        if let Some(weight) = &self.weight {
            normalized = normalized.broadcast_mul(&weight.to_dtype(normalized.dtype())?)?;
        }
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(normalized.dtype())?)?;
        }

        policy.cast_to_storage(&normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_rows_to_zero_mean_unit_variance() -> Result<()> {
        let device = Device::Cpu;
        let norm = LayerNorm::identity(NormConfig::new(4), &device, DType::F32)?;
        let input = Tensor::new(&[[[1f32, 2., 3., 4.], [10., 10., 10., 14.]]], &device)?;
        let out = norm.forward(&input, &PrecisionPolicy::default())?;

        let mean = out.mean_keepdim(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        for m in mean {
            assert!(m.abs() < 1e-5);
        }
        let var = out
            .sqr()?
            .mean_keepdim(D::Minus1)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for v in var {
            assert!((v - 1.0).abs() < 1e-3, "variance {v}");
        }
        Ok(())
    }

    #[test]
    fn accepts_rank_four_inputs() -> Result<()> {
        let device = Device::Cpu;
        let norm = LayerNorm::identity(NormConfig::new(8), &device, DType::F32)?;
        let input = Tensor::randn(0f32, 3.0, (2, 3, 4, 8), &device)?;
        let out = norm.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(out.dims(), &[2, 3, 4, 8]);
        Ok(())
    }

    #[test]
    fn affine_parameters_are_applied() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::new(&[2f32, 2.], &device)?;
        let bias = Tensor::new(&[1f32, -1.], &device)?;
        let norm = LayerNorm::new(NormConfig::new(2).with_epsilon(0.0), Some(weight), Some(bias))?;
        let input = Tensor::new(&[[[0f32, 2.]]], &device)?;
        let out = norm
            .forward(&input, &PrecisionPolicy::default())?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!((out[0] + 1.0).abs() < 1e-5);
        assert!((out[1] - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn rejects_partial_affine_parameters() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::ones(4, DType::F32, &device)?;
        assert!(LayerNorm::new(NormConfig::new(4), Some(weight), None).is_err());
        Ok(())
    }
}
