//! Glue between attention layers and the rotary embedding provider.

pub mod rope_adapter;

pub use rope_adapter::RopeAdapter;
