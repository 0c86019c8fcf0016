//! Key/value caches threaded through incremental decoding.
//!
//! Each layer owns at most one cache. Entries are laid out
//! `[batch, kv_heads, len, head_dim]`, keys are stored after rotary
//! embedding, and appends grow the length axis monotonically. A layer
//! configured to reuse an earlier layer's cache borrows that layer's
//! [`KeyValue`] read-only and keeps no cache of its own.

pub mod api;
pub mod layout;

pub use api::{KeyValue, LayerKvCache};
pub use layout::CacheLayout;
