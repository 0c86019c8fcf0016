//! Position-wise feed-forward block.
//!
//! Hidden states shaped `(batch, seq, hidden)` are expanded to
//! `config.intermediate_size`, passed through GELU, then contracted back to the
//! model hidden size.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration for [`FeedForward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    up: Linear,
    down: Linear,
}

impl FeedForward {
    pub fn new(config: FeedForwardConfig, up: Linear, down: Linear) -> Result<Self> {
        if up.config().input_dim != config.hidden_size
            || up.config().output_dim != config.intermediate_size
            || down.config().input_dim != config.intermediate_size
            || down.config().output_dim != config.hidden_size
        {
            return Err(candle_core::Error::Msg(format!(
                "feed-forward projections do not match {}->{}->{}",
                config.hidden_size, config.intermediate_size, config.hidden_size
            )));
        }
        Ok(Self { config, up, down })
    }

    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let up = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.intermediate_size),
            init,
            device,
            dtype,
        )?;
        let down = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            init,
            device,
            dtype,
        )?;
        Self::new(config, up, down)
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expanded = self.up.forward(hidden, policy)?;
        let activated = policy.cast_to_storage(&policy.cast_for_matmul(&expanded)?.gelu()?)?;
        self.down.forward(&activated, policy)
    }
}
