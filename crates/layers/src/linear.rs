//! Linear and affine projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` (or `(rows,
//! in_dim)`) and return the same leading layout with `out_dim` features. We
//! cast weights and activations to [`PrecisionPolicy::compute`] for matmuls
//! and rely on [`PrecisionPolicy::cast_to_storage`] for the final dtype.
//!
//! Weights are plain tensors, so a layer built from `candle_core::Var`
//! tensors participates in autograd and reports gradients for its parameters.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a biased projection layer.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Same as [`LinearConfig::new`] but toggles the bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Weight initialisation for attention and feed-forward projections.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform, the default for `Wqkv`, `Wq` and `out_proj`.
    XavierUniform,
    /// Zero-mean normal with a fixed standard deviation.
    Normal { std: f64 },
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::Normal { std } => Tensor::randn(0f32, *std as f32, shape, device)?,
        };
        if dtype == DType::F32 {
            Ok(weight)
        } else {
            weight.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    ///
    /// `weight` is laid out `[output_dim, input_dim]`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Returns a projection restricted to output rows `[start, start + len)`.
    ///
    /// Used to carve a query-only projection out of a fused `Wqkv`.
    pub fn rows(&self, start: usize, len: usize) -> Result<Self> {
        if start + len > self.config.output_dim {
            return Err(Error::Msg(format!(
                "row slice [{start}, {}) exceeds output dim {}",
                start + len,
                self.config.output_dim
            )));
        }
        let weight = self.weight.narrow(0, start, len)?.contiguous()?;
        let bias = match &self.bias {
            Some(bias) => Some(bias.narrow(0, start, len)?.contiguous()?),
            None => None,
        };
        let config = LinearConfig {
            input_dim: self.config.input_dim,
            output_dim: len,
            bias: self.config.bias,
        };
        Self::new(config, weight, bias)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, &checks::PARAM_DTYPES)?;
        Ok(())
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, &checks::PARAM_DTYPES)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    /// Applies the projection, promoting to the compute dtype when needed.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;

        let mut output = match *input.dims() {
            [batch, seq, _] => input
                .reshape((batch * seq, self.config.input_dim))?
                .matmul(&weight_t)?
                .reshape((batch, seq, self.config.output_dim))?,
            [_, _] => input.matmul(&weight_t)?,
            ref dims => {
                return Err(Error::Msg(format!(
                    "linear expects [B, T, H_in] or [T, H_in], got {:?}",
                    dims
                )))
            }
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }
        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        input
            .reshape((batch * seq, hidden))?
            .matmul(&weight.t()?)?
            .broadcast_add(bias)?
            .reshape((batch, seq, weight.dims()[0]))
    }

    #[test]
    fn forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 12);
        let weight = Tensor::randn(0f32, 0.05, (12, 8), &device)?;
        let bias = Tensor::randn(0f32, 0.02, 12, &device)?;
        let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;
        let reference = reference_linear(&input, &weight, &bias)?;

        for (dtype, tol) in [(DType::F32, 1e-4f32), (DType::F16, 1e-2), (DType::BF16, 2e-2)] {
            let linear = Linear::new(
                config.clone(),
                weight.to_dtype(dtype)?,
                Some(bias.to_dtype(dtype)?),
            )?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward(&input.to_dtype(dtype)?, &policy)?;
            assert_eq!(output.dims(), &[2, 5, 12]);
            assert_eq!(output.dtype(), dtype);
            let max = output
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            assert!(max <= tol, "max diff {max} for {dtype:?}");
        }
        Ok(())
    }

    #[test]
    fn row_slice_matches_prefix_of_full_projection() -> Result<()> {
        let device = Device::Cpu;
        let full = Linear::with_init(
            LinearConfig::new(6, 10),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let head = full.rows(0, 4)?;
        let input = Tensor::randn(0f32, 1.0, (1, 3, 6), &device)?;
        let policy = PrecisionPolicy::default();
        let expected = full.forward(&input, &policy)?.narrow(2, 0, 4)?;
        let got = head.forward(&input, &policy)?;
        let max = got.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max < 1e-6);
        assert!(full.rows(8, 4).is_err());
        Ok(())
    }

    #[test]
    fn gradients_flow_to_var_parameters() -> Result<()> {
        let device = Device::Cpu;
        let weight = Var::randn(0f32, 0.1, (4, 3), &device)?;
        let bias = Var::zeros(4, DType::F32, &device)?;
        let linear = Linear::new(
            LinearConfig::new(3, 4),
            weight.as_tensor().clone(),
            Some(bias.as_tensor().clone()),
        )?;
        let input = Tensor::ones((2, 2, 3), DType::F32, &device)?;
        let loss = linear.forward(&input, &PrecisionPolicy::default())?.sum_all()?;
        let grads = loss.backward()?;
        let bias_grad = grads.get(bias.as_tensor()).expect("bias grad");
        // d(sum)/d(bias) counts every (batch, seq) position.
        assert_eq!(bias_grad.to_vec1::<f32>()?, vec![4.0; 4]);
        assert!(grads.get(weight.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn mismatched_bias_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::zeros((2, 2), DType::F32, &device)?;
        let config = LinearConfig::new(2, 2).with_bias(false);
        let bias = Tensor::zeros(2, DType::F32, &device)?;
        assert!(Linear::new(config, weight, Some(bias)).is_err());
        Ok(())
    }
}
