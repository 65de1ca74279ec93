//! Memoization on top of the KV cache: cache-by-argument-hash, write-once.
//!
//! A memoization key is an ordered list of string components — configuration
//! strings first, then one stable serialization per argument. Composite
//! arguments contribute the hash of their *sorted* stringified elements, so
//! ordering of an unordered argument never splits the cache. Each component
//! is hashed, the concatenation is hashed again, and the result is the
//! `key_hash` the cache is addressed by.
//!
//! The cache is write-once per key: a computed result is never overwritten.
//! Storing over an existing `key_hash` fails with `AlreadyExists` — under
//! concurrent computation of the same key, the first writer wins and later
//! writers must treat their redundant result as discardable.
//!
//! Two surfaces:
//!
//! - [`MemoCache::get_or_compute`] for call sites that keep ownership of
//!   their computation (the retrieval algorithms' per-node-pair heuristics);
//! - [`Memoized`] for wrapping a whole computation by explicit composition —
//!   the wrapper holds the inner function and the cache handle, with key
//!   building supplied by the argument type, not inherited behavior.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::kv::{CacheValue, KvStore};
use crate::model::content_hash;
use crate::{MnemographError, Result};

/// One component of a memoization key.
#[derive(Debug, Clone)]
pub enum KeyPart {
    /// A plain string component, used verbatim.
    Text(String),
    /// An unordered collection: hashed over the sorted stringified elements,
    /// so element order never affects the key.
    Composite(Vec<String>),
}

impl KeyPart {
    fn canonical(&self) -> String {
        match self {
            KeyPart::Text(s) => s.clone(),
            KeyPart::Composite(items) => {
                let mut sorted = items.clone();
                sorted.sort();
                // Unit separator keeps ["ab","c"] distinct from ["a","bc"].
                content_hash(&sorted.join("\u{1f}"))
            }
        }
    }
}

/// Types that know how to render themselves as memoization key components.
pub trait MemoArgs {
    fn key_parts(&self) -> Vec<KeyPart>;
}

impl MemoArgs for String {
    fn key_parts(&self) -> Vec<KeyPart> {
        vec![KeyPart::Text(self.clone())]
    }
}

impl MemoArgs for &str {
    fn key_parts(&self) -> Vec<KeyPart> {
        vec![KeyPart::Text(self.to_string())]
    }
}

impl MemoArgs for Vec<String> {
    fn key_parts(&self) -> Vec<KeyPart> {
        vec![KeyPart::Composite(self.clone())]
    }
}

impl<A: MemoArgs, B: MemoArgs> MemoArgs for (A, B) {
    fn key_parts(&self) -> Vec<KeyPart> {
        let mut parts = self.0.key_parts();
        parts.extend(self.1.key_parts());
        parts
    }
}

// ---------------------------------------------------------------------------
// MemoCache
// ---------------------------------------------------------------------------

/// A write-once result cache over any [`KvStore`], namespaced by a fixed set
/// of configuration components that prefix every key.
pub struct MemoCache<K: KvStore> {
    store: K,
    namespace: Vec<String>,
}

impl<K: KvStore> MemoCache<K> {
    /// `namespace` identifies the computation (algorithm name, configuration
    /// fingerprint); it is prepended to every key so two differently
    /// configured consumers of one store never collide.
    pub fn new(store: K, namespace: Vec<String>) -> Self {
        Self { store, namespace }
    }

    /// Derive the `key_hash` for a set of argument components: hash each
    /// component (namespace first), concatenate the hashes, hash again.
    pub fn key_hash(&self, parts: &[KeyPart]) -> String {
        let mut hashes = String::new();
        for ns in &self.namespace {
            hashes.push_str(&content_hash(ns));
        }
        for part in parts {
            hashes.push_str(&content_hash(&part.canonical()));
        }
        content_hash(&hashes)
    }

    /// Look up a previously stored result. `None` on miss.
    pub fn load<R: DeserializeOwned>(&mut self, parts: &[KeyPart]) -> Result<Option<R>> {
        let key = self.key_hash(parts);
        let hits = self.store.read(&[key])?;
        match hits.into_iter().next().flatten() {
            Some(value) => Ok(Some(value.to_deserialize()?)),
            None => Ok(None),
        }
    }

    /// Store a result, write-once.
    ///
    /// # Errors
    /// `AlreadyExists` if the key already holds a value; the stored value is
    /// left untouched.
    pub fn save<R: Serialize>(&mut self, parts: &[KeyPart], result: &R) -> Result<()> {
        let key = self.key_hash(parts);
        if self.store.item_exist(&key)? {
            return Err(MnemographError::AlreadyExists(format!(
                "memoization key {key}"
            )));
        }
        let value = CacheValue::from_serialize(result)?;
        self.store.create(vec![(key, value)])
    }

    /// Return the cached result for `parts`, or run `compute`, store its
    /// result, and return it.
    pub fn get_or_compute<R>(
        &mut self,
        parts: &[KeyPart],
        compute: impl FnOnce() -> Result<R>,
    ) -> Result<R>
    where
        R: Serialize + DeserializeOwned,
    {
        if let Some(hit) = self.load(parts)? {
            debug!("memo hit");
            return Ok(hit);
        }
        let result = compute()?;
        self.save(parts, &result)?;
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Memoized
// ---------------------------------------------------------------------------

/// A computation wrapped with memoization, by explicit composition: the
/// wrapper owns the inner function and the cache handle.
///
/// On a hit the inner function is **not** invoked; on a miss it runs once and
/// its result is stored under the argument's key, write-once.
///
/// ```rust
/// use mnemograph::{MemoCache, Memoized, MemoryKv};
///
/// let cache = MemoCache::new(MemoryKv::new(), vec!["double".into()]);
/// let mut double = Memoized::new(cache, |n: &String| Ok(n.len() * 2));
/// assert_eq!(double.call(&"abc".to_string()).unwrap(), 6);
/// ```
pub struct Memoized<K: KvStore, F> {
    cache: MemoCache<K>,
    func: F,
}

impl<K: KvStore, F> Memoized<K, F> {
    pub fn new(cache: MemoCache<K>, func: F) -> Self {
        Self { cache, func }
    }

    /// Call through the cache.
    pub fn call<A, R>(&mut self, args: &A) -> Result<R>
    where
        A: MemoArgs,
        F: FnMut(&A) -> Result<R>,
        R: Serialize + DeserializeOwned,
    {
        let parts = args.key_parts();
        if let Some(hit) = self.cache.load(&parts)? {
            return Ok(hit);
        }
        let result = (self.func)(args)?;
        self.cache.save(&parts, &result)?;
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use std::cell::Cell;

    fn cache(ns: &[&str]) -> MemoCache<MemoryKv> {
        MemoCache::new(MemoryKv::new(), ns.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn second_call_with_same_args_skips_the_computation() {
        let calls = Cell::new(0u32);
        let mut memo = Memoized::new(cache(&["test"]), |s: &String| {
            calls.set(calls.get() + 1);
            Ok(s.len())
        });

        assert_eq!(memo.call(&"hello".to_string()).unwrap(), 5);
        assert_eq!(memo.call(&"hello".to_string()).unwrap(), 5);
        assert_eq!(calls.get(), 1, "hit must not invoke the inner function");
    }

    #[test]
    fn different_args_compute_independently() {
        let calls = Cell::new(0u32);
        let mut memo = Memoized::new(cache(&["test"]), |s: &String| {
            calls.set(calls.get() + 1);
            Ok(s.len())
        });

        assert_eq!(memo.call(&"a".to_string()).unwrap(), 1);
        assert_eq!(memo.call(&"bb".to_string()).unwrap(), 2);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn namespaces_partition_one_notional_store() {
        // Same argument, different configuration namespace → different keys.
        let a = cache(&["algo", "depth=3"]).key_hash(&[KeyPart::Text("q".into())]);
        let b = cache(&["algo", "depth=5"]).key_hash(&[KeyPart::Text("q".into())]);
        assert_ne!(a, b);
    }

    #[test]
    fn composite_parts_are_order_independent() {
        let c = cache(&["test"]);
        let ab = c.key_hash(&[KeyPart::Composite(vec!["a".into(), "b".into()])]);
        let ba = c.key_hash(&[KeyPart::Composite(vec!["b".into(), "a".into()])]);
        assert_eq!(ab, ba);
    }

    #[test]
    fn composite_elements_do_not_smear_across_boundaries() {
        let c = cache(&["test"]);
        let split = c.key_hash(&[KeyPart::Composite(vec!["ab".into(), "c".into()])]);
        let other = c.key_hash(&[KeyPart::Composite(vec!["a".into(), "bc".into()])]);
        assert_ne!(split, other);
    }

    #[test]
    fn save_is_write_once() {
        let mut c = cache(&["test"]);
        let parts = [KeyPart::Text("k".into())];
        c.save(&parts, &1u32).unwrap();

        let err = c.save(&parts, &2u32);
        assert!(matches!(err, Err(MnemographError::AlreadyExists(_))));
        // First value must survive the failed second write.
        assert_eq!(c.load::<u32>(&parts).unwrap(), Some(1));
    }

    #[test]
    fn get_or_compute_round_trips_structured_results() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Out {
            ids: Vec<String>,
        }

        let mut c = cache(&["structured"]);
        let parts = [KeyPart::Text("query".into())];
        let first = c
            .get_or_compute(&parts, || {
                Ok(Out {
                    ids: vec!["x".into(), "y".into()],
                })
            })
            .unwrap();
        let second: Out = c
            .get_or_compute(&parts, || panic!("must not recompute"))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tuple_args_concatenate_key_parts() {
        let args = ("config".to_string(), vec!["b".to_string(), "a".to_string()]);
        let parts = args.key_parts();
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[0], KeyPart::Text(_)));
        assert!(matches!(parts[1], KeyPart::Composite(_)));
    }
}
