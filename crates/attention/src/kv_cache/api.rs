//! Cache entries exchanged between attention layers and their caller.

use candle_core::Tensor;

use super::layout::CacheLayout;
use crate::core::AttentionError;

/// Keys (already rotated) and values for every cached position.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: Tensor,
    pub value: Tensor,
}

impl KeyValue {
    pub fn new(key: Tensor, value: Tensor) -> Self {
        Self { key, value }
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.key.dims().get(2).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks both tensors against `layout` and against each other.
    pub fn validate(&self, layout: &CacheLayout) -> Result<(usize, usize), AttentionError> {
        let key_dims = layout.validate("cached key", &self.key)?;
        let value_dims = layout.validate("cached value", &self.value)?;
        if key_dims != value_dims {
            return Err(AttentionError::shape(format!(
                "cached key {:?} and value {:?} disagree",
                self.key.dims(),
                self.value.dims()
            )));
        }
        Ok(key_dims)
    }
}

/// Past state handed to a layer.
///
/// An empty cache means "start fresh and return the cache"; callers that do
/// not want caching pass no cache at all.
#[derive(Debug, Clone, Default)]
pub struct LayerKvCache {
    entry: Option<KeyValue>,
}

impl LayerKvCache {
    pub fn empty() -> Self {
        Self { entry: None }
    }

    pub fn entry(&self) -> Option<&KeyValue> {
        self.entry.as_ref()
    }

    pub fn into_entry(self) -> Option<KeyValue> {
        self.entry
    }

    /// Cached length, which is also the rotary offset of the next token.
    pub fn len(&self) -> usize {
        self.entry.as_ref().map(KeyValue::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenates new keys/values after the cached ones along the length
    /// axis and returns the combined entry.
    pub fn append(
        &self,
        key: &Tensor,
        value: &Tensor,
        layout: &CacheLayout,
    ) -> Result<KeyValue, AttentionError> {
        let incoming = KeyValue::new(key.clone(), value.clone());
        let (batch, _) = incoming.validate(layout)?;
        let Some(past) = &self.entry else {
            return Ok(incoming);
        };
        let (past_batch, _) = past.validate(layout)?;
        if past_batch != batch {
            return Err(AttentionError::shape(format!(
                "cache batch {past_batch} does not match incoming batch {batch}"
            )));
        }
        Ok(KeyValue {
            key: Tensor::cat(&[&past.key, key], 2)?,
            value: Tensor::cat(&[&past.value, value], 2)?,
        })
    }
}

impl From<KeyValue> for LayerKvCache {
    fn from(entry: KeyValue) -> Self {
        Self { entry: Some(entry) }
    }
}
