//! Process-wide cache of rotary sine/cosine tables.
//!
//! Tables are **f32** tensors shaped `[len, rotary_dim / 2]` holding
//! `sin(p * inv_freq_i)` and `cos(p * inv_freq_i)` for `p in 0..len`. The
//! cache is bounded and evicts the least recently used entry, so layers sharing
//! a geometry share one table and long-running decode loops do not grow memory.

use candle_core::{bail, Device, DeviceLocation, Result, Tensor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

const SIN_COS_CACHE_CAPACITY: usize = 16;

static SIN_COS_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static SIN_COS_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Return the current `(hits, misses)` counters for the shared sin/cos cache.
pub fn sin_cos_cache_counters() -> (usize, usize) {
    (
        SIN_COS_CACHE_HITS.load(Ordering::Relaxed),
        SIN_COS_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

/// Reset the shared sin/cos cache counters.
pub fn reset_sin_cos_cache_stats() {
    SIN_COS_CACHE_HITS.store(0, Ordering::Relaxed);
    SIN_COS_CACHE_MISSES.store(0, Ordering::Relaxed);
}

/// Geometry and frequency parameters that fully determine a table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableSpec {
    /// Number of rotated features; the table holds half as many columns.
    pub rotary_dim: usize,
    /// Base θ of the frequency spectrum.
    pub base: f64,
    /// Divisor applied to every inverse frequency (linear position scaling).
    pub freq_divisor: f64,
}

impl TableSpec {
    pub fn new(rotary_dim: usize, base: f64) -> Self {
        Self {
            rotary_dim,
            base,
            freq_divisor: 1.0,
        }
    }

    /// `inv_freq_i = base^(-2i / rotary_dim) / freq_divisor`.
    pub fn inv_freqs(&self) -> Vec<f64> {
        (0..self.rotary_dim / 2)
            .map(|idx| {
                let exponent = (2 * idx) as f64 / self.rotary_dim as f64;
                self.base.powf(-exponent) / self.freq_divisor
            })
            .collect()
    }

    fn cache_key(&self, len: usize, device: &Device) -> String {
        let device_id = match device.location() {
            DeviceLocation::Cpu => "cpu".to_owned(),
            DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
            DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
        };
        format!(
            "len={};rot={};base={:.6};div={:.6};dev={}",
            len, self.rotary_dim, self.base, self.freq_divisor, device_id
        )
    }
}

struct SinCosCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, (Tensor, Tensor)>,
}

impl SinCosCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if pos + 1 == self.order.len() {
                return;
            }
            let key_owned = self.order.remove(pos);
            self.order.push(key_owned);
        }
    }

    fn get(&mut self, key: &str) -> Option<(Tensor, Tensor)> {
        let (sin, cos) = self.entries.get(key)?.clone();
        self.touch(key);
        Some((sin, cos))
    }

    fn insert(&mut self, key: String, value: (Tensor, Tensor)) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key.clone(), value);
            self.touch(&key);
            return;
        }

        if self.entries.len() >= self.capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }

        self.order.push(key.clone());
        self.entries.insert(key, value);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn global_sin_cos_cache() -> &'static Mutex<SinCosCache> {
    static CACHE: OnceLock<Mutex<SinCosCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(SinCosCache::new(SIN_COS_CACHE_CAPACITY)))
}

/// Number of tables currently held by the shared cache.
pub fn sin_cos_cache_len() -> usize {
    global_sin_cos_cache()
        .lock()
        .map(|guard| guard.len())
        .unwrap_or(0)
}

/// Retrieve (or lazily build) the `(sin, cos)` tables for `len` positions.
pub fn get_sin_cos(len: usize, spec: &TableSpec, device: &Device) -> Result<(Tensor, Tensor)> {
    if len == 0 {
        bail!("sin/cos table length must be non-zero");
    }
    if spec.rotary_dim < 2 || spec.rotary_dim % 2 != 0 {
        bail!("rotary_dim must be even and at least 2, got {}", spec.rotary_dim);
    }

    let cache_key = spec.cache_key(len, device);
    let cache = global_sin_cos_cache();
    {
        let mut guard = cache
            .lock()
            .map_err(|_| candle_core::Error::Msg("sin/cos cache lock poisoned".into()))?;
        if let Some(tables) = guard.get(&cache_key) {
            SIN_COS_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
            log::debug!("rope sin/cos cache hit: {}", cache_key);
            return Ok(tables);
        }
        log::debug!("rope sin/cos cache miss: {}", cache_key);
        SIN_COS_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
    }

    let inv_freqs = spec.inv_freqs();
    let half_dim = inv_freqs.len();
    let mut sin_data = Vec::with_capacity(len * half_dim);
    let mut cos_data = Vec::with_capacity(len * half_dim);
    for pos in 0..len {
        let pos_f = pos as f64;
        for &inv_freq in &inv_freqs {
            let angle = pos_f * inv_freq;
            sin_data.push(angle.sin() as f32);
            cos_data.push(angle.cos() as f32);
        }
    }

    let sin = Tensor::from_vec(sin_data, (len, half_dim), device)?;
    let cos = Tensor::from_vec(cos_data, (len, half_dim), device)?;

    let mut guard = cache
        .lock()
        .map_err(|_| candle_core::Error::Msg("sin/cos cache lock poisoned".into()))?;
    if let Some(tables) = guard.get(&cache_key) {
        return Ok(tables);
    }
    guard.insert(cache_key, (sin.clone(), cos.clone()));

    Ok((sin, cos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_oldest_entry() -> Result<()> {
        let device = Device::Cpu;
        let mut cache = SinCosCache::new(2);
        let table = Tensor::zeros((1, 1), candle_core::DType::F32, &device)?;
        cache.insert("a".into(), (table.clone(), table.clone()));
        cache.insert("b".into(), (table.clone(), table.clone()));
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), (table.clone(), table));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        Ok(())
    }

    #[test]
    fn table_rows_follow_angle_formula() -> Result<()> {
        let device = Device::Cpu;
        let spec = TableSpec::new(4, 100.0);
        let (sin, cos) = get_sin_cos(3, &spec, &device)?;
        assert_eq!(sin.dims(), &[3, 2]);
        let sin = sin.to_vec2::<f32>()?;
        let cos = cos.to_vec2::<f32>()?;
        // inv_freq = [1, 0.1]
        assert!((sin[2][0] - 2f32.sin()).abs() < 1e-6);
        assert!((cos[2][1] - 0.2f32.cos()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn odd_rotary_dim_is_rejected() {
        let spec = TableSpec::new(5, 10_000.0);
        assert!(get_sin_cos(4, &spec, &Device::Cpu).is_err());
    }
}
