//! Building blocks for transformer layers.
//!
//! Projections, normalisation and the position-wise feed-forward block used by
//! the attention crate and the decoder blocks in `model`. All layers consume
//! `(batch, seq, hidden)` tensors and stay differentiable through candle's
//! autograd so parameter gradients can be compared across attention backends.

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{LayerNorm, NormConfig};
