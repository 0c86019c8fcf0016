//! Positional encodings consumed by the attention stack.

pub mod cache;
pub mod positions;
pub mod rope;

pub use cache::{
    get_sin_cos, reset_sin_cos_cache_stats, sin_cos_cache_counters, sin_cos_cache_len, TableSpec,
};
pub use positions::{offset_positions, padding_adjusted_positions};
pub use rope::{
    build_rotary, DailKind, HfScaling, RotaryConfig, RotaryEmbedding, RotaryFormulation,
    RotaryPositions, RotaryRole,
};
