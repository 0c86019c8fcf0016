//! Embedding crate
//!
//! The positional module exposes rotary positional embeddings in two numeric
//! formulations, the shared sin/cos table cache and padding-aware position ids.

pub mod positional;

pub use positional::*;
