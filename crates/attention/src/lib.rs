//! Multi-backend self-attention.
//!
//! The crate provides the grouped-query attention layer family (multi-head,
//! multi-query and grouped-query) together with everything it needs around
//! the kernel:
//!
//! * [`masks`] builds dense additive biases: causal, alibi, sliding window
//!   and sequence-id masking.
//! * [`packing`] derives the segment descriptors the fused backend consumes
//!   instead of a dense bias.
//! * [`reference`] and [`fused`] are the two interchangeable kernels behind
//!   [`core::AttentionKernel`]. They agree within floating-point tolerance on
//!   outputs and gradients for every supported feature combination.
//! * [`kv_cache`] holds per-layer key/value caches, including entries
//!   borrowed by layers that reuse an earlier layer's keys.
//! * [`layer`] wires projection, clipping, query/key normalisation, rotary
//!   embeddings and the kernel into one layer.
//!
//! Configuration is validated eagerly by [`AttentionConfig::resolve`]; layers
//! only ever see a [`ResolvedAttentionConfig`].

pub mod core;
pub mod fused;
pub mod interop;
pub mod kv_cache;
pub mod layer;
pub mod masks;
pub mod packing;
pub mod reference;

pub use crate::core::{
    AttentionConfig, AttentionError, AttentionKernel, Backend, ConfigError, KernelParams,
    KernelVersion, MaskInputs, PositionEncoding, ResolvedAttentionConfig,
};
pub use crate::interop::RopeAdapter;
pub use crate::kv_cache::{CacheLayout, KeyValue, LayerKvCache};
pub use crate::layer::{
    AttentionInputs, AttentionOutput, AttentionParams, GroupedQueryAttention, Projection,
};
pub use crate::packing::{build_packing_descriptor, PackingDescriptor, Segment};
