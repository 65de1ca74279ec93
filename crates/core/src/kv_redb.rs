//! Persistent `KvStore` tier backed by redb.
//!
//! The reference slow tier for [`crate::TieredKv`]. All writes are ACID: one
//! `WriteTransaction` per mutating call, committed at the end; dropping the
//! transaction on an error path is an implicit rollback.
//!
//! Values are stored as the serialized [`CacheValue`] envelope, so the
//! bytes/not-bytes distinction survives a round trip through disk. Usage
//! scores live in a second table keyed by the same ids.

use std::collections::{HashMap, HashSet};

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use crate::kv::{CacheValue, KvStore};
use crate::{MnemographError, Result};

/// Envelope JSON keyed by cache id.
const ITEMS: TableDefinition<&str, &str> = TableDefinition::new("cache_items");
/// Usage score keyed by cache id. Absent row = score 0.
const SCORES: TableDefinition<&str, f64> = TableDefinition::new("cache_scores");

/// A redb-backed persistent key-value store.
pub struct RedbKv {
    db: Database,
}

impl RedbKv {
    /// Open or create a store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory store (no file I/O). Useful for tests and
    /// ephemeral workloads; data is lost when the instance is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(ITEMS)?;
        write_txn.open_table(SCORES)?;
        write_txn.commit()?;
        Ok(Self { db })
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

impl KvStore for RedbKv {
    fn create(&mut self, items: Vec<(String, CacheValue)>) -> Result<()> {
        validate_batch_ids(items.iter().map(|(id, _)| id.as_str()))?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ITEMS)?;
            for (id, value) in &items {
                // Already-present ids are skipped, never overwritten.
                let present = table.get(id.as_str())?.is_some();
                if !present {
                    let json = serde_json::to_string(value)?;
                    table.insert(id.as_str(), json.as_str())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn read(&mut self, ids: &[String]) -> Result<Vec<Option<CacheValue>>> {
        validate_batch_ids(ids.iter().map(String::as_str))?;
        // A write transaction so score bumps land in the same atomic unit as
        // the reads that earned them.
        let write_txn = self.db.begin_write()?;
        let mut out = Vec::with_capacity(ids.len());
        {
            let table = write_txn.open_table(ITEMS)?;
            let mut scores = write_txn.open_table(SCORES)?;
            for id in ids {
                let hit: Option<String> = table
                    .get(id.as_str())?
                    .map(|guard| guard.value().to_string());
                match hit {
                    Some(json) => {
                        let prev: f64 = scores.get(id.as_str())?.map(|g| g.value()).unwrap_or(0.0);
                        scores.insert(id.as_str(), prev + 1.0)?;
                        out.push(Some(serde_json::from_str(&json)?));
                    }
                    None => out.push(None),
                }
            }
        }
        write_txn.commit()?;
        Ok(out)
    }

    fn update(&mut self, items: Vec<(String, CacheValue)>) -> Result<()> {
        validate_batch_ids(items.iter().map(|(id, _)| id.as_str()))?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ITEMS)?;
            // Existence check for the whole batch first; dropping the txn on
            // the error path rolls back nothing-yet-written.
            for (id, _) in &items {
                if table.get(id.as_str())?.is_none() {
                    return Err(MnemographError::NotFound(format!("cache id {id}")));
                }
            }
            for (id, value) in &items {
                let json = serde_json::to_string(value)?;
                table.insert(id.as_str(), json.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&mut self, ids: &[String]) -> Result<()> {
        validate_batch_ids(ids.iter().map(String::as_str))?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ITEMS)?;
            let mut scores = write_txn.open_table(SCORES)?;
            for id in ids {
                if table.get(id.as_str())?.is_none() {
                    return Err(MnemographError::NotFound(format!("cache id {id}")));
                }
            }
            for id in ids {
                table.remove(id.as_str())?;
                scores.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn item_exist(&self, id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ITEMS)?;
        Ok(table.get(id)?.is_some())
    }

    fn count_items(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ITEMS)?;
        Ok(table.len()? as usize)
    }

    fn clear(&mut self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(ITEMS)?;
        write_txn.delete_table(SCORES)?;
        write_txn.open_table(ITEMS)?;
        write_txn.open_table(SCORES)?;
        write_txn.commit()?;
        Ok(())
    }

    fn update_item_scores(&mut self, deltas: &HashMap<String, f64>) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let table = write_txn.open_table(ITEMS)?;
            let mut scores = write_txn.open_table(SCORES)?;
            for (id, delta) in deltas {
                if table.get(id.as_str())?.is_some() {
                    let prev: f64 = scores.get(id.as_str())?.map(|g| g.value()).unwrap_or(0.0);
                    scores.insert(id.as_str(), prev + delta)?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_rare_items(&mut self, n: usize) -> Result<Vec<String>> {
        let write_txn = self.db.begin_write()?;
        let evicted;
        {
            let mut table = write_txn.open_table(ITEMS)?;
            let mut scores = write_txn.open_table(SCORES)?;

            let mut ranked: Vec<(String, f64)> = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                let id = key.value().to_string();
                let score: f64 = scores.get(id.as_str())?.map(|g| g.value()).unwrap_or(0.0);
                ranked.push((id, score));
            }
            ranked.sort_by(|(a_id, a), (b_id, b)| {
                a.partial_cmp(b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a_id.cmp(b_id))
            });
            evicted = ranked
                .into_iter()
                .take(n)
                .map(|(id, _)| id)
                .collect::<Vec<String>>();

            for id in &evicted {
                table.remove(id.as_str())?;
                scores.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "evicted rare persistent items");
        }
        Ok(evicted)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKv, TieredKv};

    fn val(s: &str) -> CacheValue {
        CacheValue::NotBytes(serde_json::Value::String(s.to_string()))
    }

    fn item(id: &str, v: &str) -> (String, CacheValue) {
        (id.to_string(), val(v))
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn create_read_round_trip() {
        let mut kv = RedbKv::open_in_memory().unwrap();
        kv.create(vec![item("a", "1"), item("b", "2")]).unwrap();

        let out = kv.read(&ids(&["a", "ghost", "b"])).unwrap();
        assert_eq!(out[0], Some(val("1")));
        assert_eq!(out[1], None);
        assert_eq!(out[2], Some(val("2")));
        assert_eq!(kv.count_items().unwrap(), 2);
    }

    #[test]
    fn bytes_envelope_survives_storage() {
        let mut kv = RedbKv::open_in_memory().unwrap();
        kv.create(vec![("blob".to_string(), CacheValue::Bytes(vec![0, 255, 7]))])
            .unwrap();
        let out = kv.read(&ids(&["blob"])).unwrap();
        assert_eq!(out[0], Some(CacheValue::Bytes(vec![0, 255, 7])));
    }

    #[test]
    fn create_existing_id_is_silently_skipped() {
        let mut kv = RedbKv::open_in_memory().unwrap();
        kv.create(vec![item("a", "first")]).unwrap();
        kv.create(vec![item("a", "second")]).unwrap();
        assert_eq!(kv.read(&ids(&["a"])).unwrap()[0], Some(val("first")));
    }

    #[test]
    fn update_and_delete_enforce_presence() {
        let mut kv = RedbKv::open_in_memory().unwrap();
        kv.create(vec![item("a", "1")]).unwrap();

        assert!(matches!(
            kv.update(vec![item("ghost", "x")]),
            Err(MnemographError::NotFound(_))
        ));
        assert!(matches!(
            kv.delete(&ids(&["ghost"])),
            Err(MnemographError::NotFound(_))
        ));

        kv.update(vec![item("a", "new")]).unwrap();
        assert_eq!(kv.read(&ids(&["a"])).unwrap()[0], Some(val("new")));
        kv.delete(&ids(&["a"])).unwrap();
        assert!(!kv.item_exist("a").unwrap());
    }

    #[test]
    fn eviction_follows_read_scores() {
        let mut kv = RedbKv::open_in_memory().unwrap();
        kv.create(vec![item("hot", "1"), item("cold", "2")]).unwrap();
        kv.read(&ids(&["hot"])).unwrap();
        kv.read(&ids(&["hot"])).unwrap();

        let evicted = kv.delete_rare_items(1).unwrap();
        assert_eq!(evicted, vec!["cold".to_string()]);
        assert!(kv.item_exist("hot").unwrap());
    }

    #[test]
    fn clear_empties_both_tables() {
        let mut kv = RedbKv::open_in_memory().unwrap();
        kv.create(vec![item("a", "1")]).unwrap();
        kv.read(&ids(&["a"])).unwrap();
        kv.clear().unwrap();
        assert_eq!(kv.count_items().unwrap(), 0);
        assert!(!kv.item_exist("a").unwrap());
    }

    #[test]
    fn values_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.mnemograph");
        let path_str = path.to_str().unwrap();

        {
            let mut kv = RedbKv::open(path_str).unwrap();
            kv.create(vec![item("a", "persisted")]).unwrap();
        }

        let mut kv = RedbKv::open(path_str).unwrap();
        assert_eq!(kv.read(&ids(&["a"])).unwrap()[0], Some(val("persisted")));
    }

    #[test]
    fn works_as_the_slow_tier() {
        let mut kv = TieredKv::new(MemoryKv::new(), RedbKv::open_in_memory().unwrap());
        kv.create(vec![item("a", "1")]).unwrap();

        assert!(!kv.fast().item_exist("a").unwrap());
        assert_eq!(kv.read(&ids(&["a"])).unwrap()[0], Some(val("1")));
        assert!(kv.fast().item_exist("a").unwrap(), "promoted on read");
    }
}
