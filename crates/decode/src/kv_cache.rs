//! Per-layer key/value cache for incremental decoding.
//!
//! The first step submits the whole prompt and the executor returns
//! key/value tensors covering it. Every later step submits only the newly
//! generated token and receives tensors extended by one slot along the
//! sequence axis, which replace the stored ones wholesale.

use crate::config::ModelTopology;
use crate::error::{DecodeError, DecodeResult};
use ndarray::{Array4, ArrayView4, Axis};

/// Sequence axis of `[batch, heads, cache_length, head_dim]` tensors.
pub const SEQ_AXIS: usize = 2;

/// Key and value tensors for one layer, each `[batch, heads, cache_length, head_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KvCacheEntry {
    pub key: Array4<f32>,
    pub value: Array4<f32>,
}

impl KvCacheEntry {
    pub fn new(key: Array4<f32>, value: Array4<f32>) -> Self {
        Self { key, value }
    }

    pub fn empty(batch: usize, heads: usize, head_dim: usize) -> Self {
        Self {
            key: Array4::zeros((batch, heads, 0, head_dim)),
            value: Array4::zeros((batch, heads, 0, head_dim)),
        }
    }

    pub fn cache_length(&self) -> usize {
        self.key.len_of(Axis(SEQ_AXIS))
    }
}

/// Read-only view of every layer, handed to the executor for one call.
#[derive(Debug, Clone, Copy)]
pub struct CacheView<'a> {
    entries: &'a [KvCacheEntry],
}

impl<'a> CacheView<'a> {
    pub fn layer_count(&self) -> usize {
        self.entries.len()
    }

    pub fn cache_length(&self) -> usize {
        self.entries.first().map_or(0, KvCacheEntry::cache_length)
    }

    pub fn layer(&self, index: usize) -> Option<(ArrayView4<'a, f32>, ArrayView4<'a, f32>)> {
        self.entries
            .get(index)
            .map(|entry| (entry.key.view(), entry.value.view()))
    }

    pub fn entries(&self) -> &'a [KvCacheEntry] {
        self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a KvCacheEntry> {
        self.entries.iter()
    }
}

/// Ordered layer index -> [`KvCacheEntry`] map owned by a single session.
#[derive(Debug, Clone)]
pub struct CacheStore {
    layers: Vec<KvCacheEntry>,
    batch: usize,
    heads: usize,
    head_dim: usize,
}

impl CacheStore {
    /// Zero-length entries for every layer.
    pub fn initialize(layer_count: usize, batch: usize, heads: usize, head_dim: usize) -> Self {
        let layers = (0..layer_count)
            .map(|_| KvCacheEntry::empty(batch, heads, head_dim))
            .collect();
        Self {
            layers,
            batch,
            heads,
            head_dim,
        }
    }

    pub fn for_topology(topology: &ModelTopology, batch: usize) -> Self {
        Self::initialize(topology.layer_count, batch, topology.heads, topology.head_dim)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Sequence length held by layer 0. Equal across layers whenever
    /// [`is_consistent`](Self::is_consistent) holds.
    pub fn cache_length(&self) -> usize {
        self.layers.first().map_or(0, KvCacheEntry::cache_length)
    }

    pub fn layer_lengths(&self) -> Vec<usize> {
        self.layers.iter().map(KvCacheEntry::cache_length).collect()
    }

    pub fn is_consistent(&self) -> bool {
        let expected = self.cache_length();
        self.layers
            .iter()
            .all(|entry| entry.cache_length() == expected && entry.value.dim() == entry.key.dim())
    }

    pub fn view(&self) -> CacheView<'_> {
        CacheView {
            entries: &self.layers,
        }
    }

    pub fn layer(&self, index: usize) -> Option<&KvCacheEntry> {
        self.layers.get(index)
    }

    /// Replace one layer with executor-returned tensors. The new tensors
    /// must keep batch/heads/head_dim and must not be shorter than the
    /// entry they replace.
    pub fn merge(
        &mut self,
        layer_index: usize,
        new_key: Array4<f32>,
        new_value: Array4<f32>,
    ) -> DecodeResult<()> {
        self.check_entry(layer_index, &new_key, &new_value, None)?;
        self.layers[layer_index] = KvCacheEntry::new(new_key, new_value);
        Ok(())
    }

    /// Fold a full step's worth of returned tensors in, all layers or none.
    ///
    /// `appended` is the number of tokens submitted in the step; every
    /// returned entry must be exactly `cache_length + appended` long. All
    /// entries are validated before the first one is stored.
    pub fn commit(&mut self, present: Vec<KvCacheEntry>, appended: usize) -> DecodeResult<()> {
        if present.len() != self.layers.len() {
            return Err(DecodeError::LayerCountMismatch {
                expected: self.layers.len(),
                found: present.len(),
            });
        }

        let expected_len = self.cache_length() + appended;
        for (index, entry) in present.iter().enumerate() {
            self.check_entry(index, &entry.key, &entry.value, Some(expected_len))?;
        }

        for (index, entry) in present.into_iter().enumerate() {
            self.merge(index, entry.key, entry.value)?;
        }
        debug_assert!(self.is_consistent());
        Ok(())
    }

    pub fn reset(&mut self) {
        let (batch, heads, head_dim) = (self.batch, self.heads, self.head_dim);
        for entry in &mut self.layers {
            *entry = KvCacheEntry::empty(batch, heads, head_dim);
        }
    }

    /// Bytes added across all layers per cached token.
    pub fn bytes_per_token(&self) -> usize {
        // 2 (K+V) * layers * batch * heads * head_dim * sizeof(f32)
        2 * self.layers.len() * self.batch * self.heads * self.head_dim * std::mem::size_of::<f32>()
    }

    pub fn total_bytes(&self) -> usize {
        self.bytes_per_token() * self.cache_length()
    }

    fn check_entry(
        &self,
        layer_index: usize,
        key: &Array4<f32>,
        value: &Array4<f32>,
        expected_len: Option<usize>,
    ) -> DecodeResult<()> {
        let current = self
            .layers
            .get(layer_index)
            .ok_or(DecodeError::LayerOutOfRange {
                index: layer_index,
                layer_count: self.layers.len(),
            })?;

        let found_len = key.len_of(Axis(SEQ_AXIS));
        let want_len = match expected_len {
            Some(len) => len,
            None if found_len >= current.cache_length() => found_len,
            None => current.cache_length(),
        };
        let expected = [self.batch, self.heads, want_len, self.head_dim];

        if key.shape() != expected {
            return Err(DecodeError::shape(
                format!("layer {layer_index} key"),
                &expected,
                key.shape(),
            ));
        }
        if value.shape() != expected {
            return Err(DecodeError::shape(
                format!("layer {layer_index} value"),
                &expected,
                value.shape(),
            ));
        }
        Ok(())
    }
}
