//! Portable, exact attention over a dense bias.
//!
//! This path materialises the full `[q_len, k_len]` score matrix per head and
//! is the baseline for validating the fused kernel.

pub mod exact;

pub use exact::ExactAttention;
