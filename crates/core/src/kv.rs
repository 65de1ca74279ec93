//! Key-value cache abstraction: one CRUD contract over pluggable stores.
//!
//! Three compositions are provided:
//!
//! - [`MemoryKv`] — unbounded in-memory store with per-id usage scores;
//! - [`BoundedKv`] — enforces a capacity by evicting the lowest-scoring ids
//!   *before* an insert would overflow;
//! - [`TieredKv`] — a fast volatile tier in front of a slow persistent tier
//!   with promote-on-read (the slow tier is authoritative, the fast tier is
//!   a lazily-populated view — same discipline as an in-memory index rebuilt
//!   from its backing table).
//!
//! Contract points shared by every implementation:
//!
//! - `create` fails on duplicate ids *within the batch* and silently skips
//!   ids already present in the store (write-once enforcement with an error
//!   belongs to the memoization layer, [`crate::MemoCache`]);
//! - `read` is batch + order-preserving, `None` per miss; a hit bumps the
//!   id's usage score;
//! - `update`/`delete` fail with `NotFound` before any mutation if any id is
//!   absent.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{MnemographError, Result};

// ---------------------------------------------------------------------------
// Value envelope
// ---------------------------------------------------------------------------

/// Serialized value envelope: preserves whether the cached value was a raw
/// byte blob or structured data, since backends may store the two
/// differently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "kebab-case")]
pub enum CacheValue {
    /// A raw byte blob.
    Bytes(Vec<u8>),
    /// Any non-byte value, carried as JSON.
    NotBytes(serde_json::Value),
}

impl CacheValue {
    /// Wrap a serializable value in the `not-bytes` arm.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(CacheValue::NotBytes(serde_json::to_value(value)?))
    }

    /// Extract a deserializable value from the `not-bytes` arm.
    pub fn to_deserialize<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        match self {
            CacheValue::NotBytes(v) => Ok(serde_json::from_value(v.clone())?),
            CacheValue::Bytes(_) => Err(MnemographError::Validation(
                "expected a not-bytes cache value, found raw bytes".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// The store contract
// ---------------------------------------------------------------------------

/// Uniform CRUD contract over pluggable key-value stores.
///
/// `read` takes `&mut self` because a successful hit updates the id's usage
/// score (the input to [`KvStore::delete_rare_items`] eviction).
pub trait KvStore {
    /// Insert a batch. Duplicate ids within the batch fail with
    /// `Validation` before any mutation; ids already present in the store
    /// are silently skipped.
    fn create(&mut self, items: Vec<(String, CacheValue)>) -> Result<()>;

    /// Order-preserving batch read; `None` per miss.
    fn read(&mut self, ids: &[String]) -> Result<Vec<Option<CacheValue>>>;

    /// Overwrite existing items. `NotFound` (before any mutation) if any id
    /// is absent.
    fn update(&mut self, items: Vec<(String, CacheValue)>) -> Result<()>;

    /// Remove items. `NotFound` (before any mutation) if any id is absent.
    fn delete(&mut self, ids: &[String]) -> Result<()>;

    fn item_exist(&self, id: &str) -> Result<bool>;

    fn count_items(&self) -> Result<usize>;

    fn clear(&mut self) -> Result<()>;

    /// Add `delta` to each id's usage score. Unknown ids are ignored.
    /// Stores without usage tracking may keep the default no-op.
    fn update_item_scores(&mut self, _deltas: &HashMap<String, f64>) -> Result<()> {
        Ok(())
    }

    /// Evict the `n` lowest-scoring ids; returns the evicted ids. Stores
    /// without usage tracking may keep the default no-op.
    fn delete_rare_items(&mut self, _n: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Reject empty ids and duplicates within one batch, before any mutation.
fn validate_batch_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(MnemographError::Validation(
                "cache id must not be empty".into(),
            ));
        }
        if !seen.insert(id) {
            return Err(MnemographError::Validation(format!(
                "duplicate id in batch: {id}"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Unbounded in-memory store with usage scores. The reference `KvStore`.
#[derive(Debug, Default)]
pub struct MemoryKv {
    items: HashMap<String, CacheValue>,
    scores: HashMap<String, f64>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn create(&mut self, items: Vec<(String, CacheValue)>) -> Result<()> {
        validate_batch_ids(items.iter().map(|(id, _)| id.as_str()))?;
        for (id, value) in items {
            // Already-present ids are skipped, never overwritten.
            self.items.entry(id).or_insert(value);
        }
        Ok(())
    }

    fn read(&mut self, ids: &[String]) -> Result<Vec<Option<CacheValue>>> {
        validate_batch_ids(ids.iter().map(String::as_str))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let hit = self.items.get(id).cloned();
            if hit.is_some() {
                *self.scores.entry(id.clone()).or_insert(0.0) += 1.0;
            }
            out.push(hit);
        }
        Ok(out)
    }

    fn update(&mut self, items: Vec<(String, CacheValue)>) -> Result<()> {
        validate_batch_ids(items.iter().map(|(id, _)| id.as_str()))?;
        if let Some((missing, _)) = items.iter().find(|(id, _)| !self.items.contains_key(id)) {
            return Err(MnemographError::NotFound(format!("cache id {missing}")));
        }
        for (id, value) in items {
            self.items.insert(id, value);
        }
        Ok(())
    }

    fn delete(&mut self, ids: &[String]) -> Result<()> {
        validate_batch_ids(ids.iter().map(String::as_str))?;
        if let Some(missing) = ids.iter().find(|id| !self.items.contains_key(*id)) {
            return Err(MnemographError::NotFound(format!("cache id {missing}")));
        }
        for id in ids {
            self.items.remove(id);
            self.scores.remove(id);
        }
        Ok(())
    }

    fn item_exist(&self, id: &str) -> Result<bool> {
        Ok(self.items.contains_key(id))
    }

    fn count_items(&self) -> Result<usize> {
        Ok(self.items.len())
    }

    fn clear(&mut self) -> Result<()> {
        self.items.clear();
        self.scores.clear();
        Ok(())
    }

    fn update_item_scores(&mut self, deltas: &HashMap<String, f64>) -> Result<()> {
        for (id, delta) in deltas {
            if self.items.contains_key(id) {
                *self.scores.entry(id.clone()).or_insert(0.0) += delta;
            }
        }
        Ok(())
    }

    fn delete_rare_items(&mut self, n: usize) -> Result<Vec<String>> {
        let mut ranked: Vec<(String, f64)> = self
            .items
            .keys()
            .map(|id| (id.clone(), self.scores.get(id).copied().unwrap_or(0.0)))
            .collect();
        // Tie-break on id so eviction order is deterministic.
        ranked.sort_by(|(a_id, a), (b_id, b)| {
            a.partial_cmp(b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a_id.cmp(b_id))
        });
        let evicted: Vec<String> = ranked.into_iter().take(n).map(|(id, _)| id).collect();
        for id in &evicted {
            self.items.remove(id);
            self.scores.remove(id);
        }
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "evicted rare cache items");
        }
        Ok(evicted)
    }
}

// ---------------------------------------------------------------------------
// Bounded store
// ---------------------------------------------------------------------------

/// A capacity-bounded store: `create` evicts the lowest-scoring resident
/// items before an insert would exceed `max_storage`.
#[derive(Debug)]
pub struct BoundedKv {
    inner: MemoryKv,
    max_storage: usize,
}

impl BoundedKv {
    /// # Errors
    /// `Validation` if `max_storage` is zero.
    pub fn new(max_storage: usize) -> Result<Self> {
        if max_storage == 0 {
            return Err(MnemographError::Validation(
                "max_storage must be at least 1".into(),
            ));
        }
        Ok(Self {
            inner: MemoryKv::new(),
            max_storage,
        })
    }

    pub fn max_storage(&self) -> usize {
        self.max_storage
    }
}

impl KvStore for BoundedKv {
    fn create(&mut self, items: Vec<(String, CacheValue)>) -> Result<()> {
        validate_batch_ids(items.iter().map(|(id, _)| id.as_str()))?;
        // Only genuinely new ids count toward capacity — already-present ids
        // are skipped by the inner create.
        let incoming = items
            .iter()
            .filter(|(id, _)| !self.inner.items.contains_key(id))
            .count();
        if incoming > self.max_storage {
            return Err(MnemographError::Validation(format!(
                "batch of {incoming} new items exceeds max_storage {}",
                self.max_storage
            )));
        }
        let count = self.inner.count_items()?;
        if count + incoming > self.max_storage {
            self.inner
                .delete_rare_items(count + incoming - self.max_storage)?;
        }
        self.inner.create(items)
    }

    fn read(&mut self, ids: &[String]) -> Result<Vec<Option<CacheValue>>> {
        self.inner.read(ids)
    }

    fn update(&mut self, items: Vec<(String, CacheValue)>) -> Result<()> {
        self.inner.update(items)
    }

    fn delete(&mut self, ids: &[String]) -> Result<()> {
        self.inner.delete(ids)
    }

    fn item_exist(&self, id: &str) -> Result<bool> {
        self.inner.item_exist(id)
    }

    fn count_items(&self) -> Result<usize> {
        self.inner.count_items()
    }

    fn clear(&mut self) -> Result<()> {
        self.inner.clear()
    }

    fn update_item_scores(&mut self, deltas: &HashMap<String, f64>) -> Result<()> {
        self.inner.update_item_scores(deltas)
    }

    fn delete_rare_items(&mut self, n: usize) -> Result<Vec<String>> {
        self.inner.delete_rare_items(n)
    }
}

// ---------------------------------------------------------------------------
// Two-tier store
// ---------------------------------------------------------------------------

/// A fast volatile cache in front of a slow persistent store.
///
/// - `read` probes the fast tier first; misses fall through to the slow tier
///   and, when found there, are promoted into the fast tier before being
///   returned;
/// - `create` writes only the slow tier (the fast tier populates lazily);
/// - `update` / `delete` apply to both tiers (the fast tier only where the
///   id is resident);
/// - `count_items` reports the authoritative slow tier.
#[derive(Debug)]
pub struct TieredKv<F: KvStore, S: KvStore> {
    fast: F,
    slow: S,
}

impl<F: KvStore, S: KvStore> TieredKv<F, S> {
    pub fn new(fast: F, slow: S) -> Self {
        Self { fast, slow }
    }

    /// The fast tier, for inspection in tests and diagnostics.
    pub fn fast(&self) -> &F {
        &self.fast
    }
}

impl<F: KvStore, S: KvStore> KvStore for TieredKv<F, S> {
    fn create(&mut self, items: Vec<(String, CacheValue)>) -> Result<()> {
        self.slow.create(items)
    }

    fn read(&mut self, ids: &[String]) -> Result<Vec<Option<CacheValue>>> {
        let mut out = self.fast.read(ids)?;

        let miss_ids: Vec<String> = ids
            .iter()
            .zip(out.iter())
            .filter(|(_, v)| v.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if miss_ids.is_empty() {
            return Ok(out);
        }

        let slow_hits = self.slow.read(&miss_ids)?;

        // Promote slow-tier hits into the fast tier before returning. A
        // bounded fast tier may evict to make room; create's skip-existing
        // semantics make the promotion idempotent.
        let promote: Vec<(String, CacheValue)> = miss_ids
            .iter()
            .zip(slow_hits.iter())
            .filter_map(|(id, v)| v.clone().map(|v| (id.clone(), v)))
            .collect();
        if !promote.is_empty() {
            debug!(promoted = promote.len(), "promoting slow-tier hits");
            self.fast.create(promote)?;
        }

        let mut slow_iter = slow_hits.into_iter();
        for slot in out.iter_mut().filter(|v| v.is_none()) {
            *slot = slow_iter.next().flatten();
        }
        Ok(out)
    }

    fn update(&mut self, items: Vec<(String, CacheValue)>) -> Result<()> {
        let fast_items: Vec<(String, CacheValue)> = items
            .iter()
            .filter(|(id, _)| self.fast.item_exist(id).unwrap_or(false))
            .cloned()
            .collect();
        self.slow.update(items)?;
        if !fast_items.is_empty() {
            self.fast.update(fast_items)?;
        }
        Ok(())
    }

    fn delete(&mut self, ids: &[String]) -> Result<()> {
        let fast_ids: Vec<String> = ids
            .iter()
            .filter(|id| self.fast.item_exist(id).unwrap_or(false))
            .cloned()
            .collect();
        self.slow.delete(ids)?;
        if !fast_ids.is_empty() {
            self.fast.delete(&fast_ids)?;
        }
        Ok(())
    }

    fn item_exist(&self, id: &str) -> Result<bool> {
        Ok(self.fast.item_exist(id)? || self.slow.item_exist(id)?)
    }

    fn count_items(&self) -> Result<usize> {
        self.slow.count_items()
    }

    fn clear(&mut self) -> Result<()> {
        self.fast.clear()?;
        self.slow.clear()
    }

    fn update_item_scores(&mut self, deltas: &HashMap<String, f64>) -> Result<()> {
        self.fast.update_item_scores(deltas)?;
        self.slow.update_item_scores(deltas)
    }

    fn delete_rare_items(&mut self, n: usize) -> Result<Vec<String>> {
        self.fast.delete_rare_items(n)?;
        self.slow.delete_rare_items(n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
