//! Decoder-only transformer stack.
//!
//! [`Model`] owns the decoder blocks and, once per forward call, builds the
//! state every attention layer shares: the dense bias or packing descriptor,
//! rotary positions and alibi slopes. It runs blocks in order and hands each
//! layer that reuses key/values the entry its producer just returned.

pub mod block;
pub mod config;
pub mod error;
pub mod model;

pub use block::DecoderBlock;
pub use config::ModelConfig;
pub use error::ModelError;
pub use model::{Model, ModelOutput};
