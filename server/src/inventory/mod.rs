//! The worker chunk inventory: which `(database, chunk)` resources this
//! worker advertises to the dispatcher fabric.

pub mod monitor;

use crate::db::meta::{MetaError, MetaStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// `database -> set of hosted chunks`.
pub type ExistMap = BTreeMap<String, BTreeSet<i32>>;

/// Chunks present in `lhs` but missing from `rhs`. Each side is a
/// self-consistent snapshot; callers combining two live inventories
/// tolerate the skew between the two snapshot instants.
pub fn diff(lhs: &ExistMap, rhs: &ExistMap) -> ExistMap {
    let mut result = ExistMap::new();
    for (db, chunks) in lhs {
        match rhs.get(db) {
            Some(other) => {
                let missing: BTreeSet<i32> = chunks.difference(other).copied().collect();
                if !missing.is_empty() {
                    result.insert(db.clone(), missing);
                }
            }
            None => {
                result.insert(db.clone(), chunks.clone());
            }
        }
    }
    result
}

/// A thread-safe `(database, chunk)` resource map with a persistent
/// backing store.
///
/// The in-memory map and the store are not committed atomically: the
/// persistent variants write the store first, then update memory. A
/// crash between the two leaves the store ahead of memory, which
/// `init` reconciles on restart.
pub struct ChunkInventory {
    /// Instance name, used for the backing schema.
    name: String,
    /// Worker UUID, read from the store.
    id: Mutex<String>,
    exist_map: Mutex<ExistMap>,
}

impl ChunkInventory {
    pub fn new(name: impl Into<String>) -> Self {
        ChunkInventory {
            name: name.into(),
            id: Mutex::new(String::new()),
            exist_map: Mutex::new(ExistMap::new()),
        }
    }

    /// An inventory over an explicit map, for set-list commands and
    /// tests.
    pub fn with_map(exist_map: ExistMap, name: impl Into<String>, id: impl Into<String>) -> Self {
        ChunkInventory {
            name: name.into(),
            id: Mutex::new(id.into()),
            exist_map: Mutex::new(exist_map),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> String {
        self.id.lock().expect("inventory lock poisoned").clone()
    }

    /// Register a chunk in memory. Idempotent; the database key is
    /// created when absent.
    pub fn add(&self, db: &str, chunk: i32) {
        tracing::debug!(db, chunk, "inventory add");
        self.exist_map
            .lock()
            .expect("inventory lock poisoned")
            .entry(db.to_string())
            .or_default()
            .insert(chunk);
    }

    /// Unregister a chunk in memory. A missing database or chunk is
    /// quietly ignored.
    pub fn remove(&self, db: &str, chunk: i32) {
        tracing::debug!(db, chunk, "inventory remove");
        let mut map = self.exist_map.lock().expect("inventory lock poisoned");
        if let Some(chunks) = map.get_mut(db) {
            chunks.remove(&chunk);
        }
    }

    pub fn has(&self, db: &str, chunk: i32) -> bool {
        self.exist_map
            .lock()
            .expect("inventory lock poisoned")
            .get(db)
            .is_some_and(|chunks| chunks.contains(&chunk))
    }

    /// A snapshot copy of the map, for lock-free iteration by callers.
    pub fn exist_map(&self) -> ExistMap {
        self.exist_map.lock().expect("inventory lock poisoned").clone()
    }

    pub fn databases(&self) -> BTreeSet<String> {
        self.exist_map.lock().expect("inventory lock poisoned").keys().cloned().collect()
    }

    /// Register a chunk in the store, then in memory. Fails with
    /// `InvalidParam` when the database is not published.
    pub async fn add_persistent<S: MetaStore>(
        &self,
        store: &S,
        db: &str,
        chunk: i32,
    ) -> Result<(), MetaError> {
        store.add_chunk(db, chunk).await?;
        self.add(db, chunk);
        Ok(())
    }

    /// Unregister a chunk in the store, then in memory. Unconditional.
    pub async fn remove_persistent<S: MetaStore>(
        &self,
        store: &S,
        db: &str,
        chunk: i32,
    ) -> Result<(), MetaError> {
        store.remove_chunk(db, chunk).await?;
        self.remove(db, chunk);
        Ok(())
    }

    /// Replace the in-memory state with the store's: databases, their
    /// chunks, and the worker UUID.
    pub async fn init<S: MetaStore>(&self, store: &S) -> Result<(), MetaError> {
        let dbs = store.dbs().await?;
        if dbs.is_empty() {
            tracing::warn!(instance = %self.name, "no databases are published on this worker");
        }
        let mut fresh = ExistMap::new();
        for db in dbs {
            let chunks: BTreeSet<i32> = store.chunks(&db).await?.into_iter().collect();
            if chunks.is_empty() {
                tracing::warn!(db, "no published chunks for database");
            }
            fresh.insert(db, chunks);
        }
        let uuid = store.worker_uuid().await?.unwrap_or_else(|| {
            tracing::warn!(instance = %self.name, "the worker has no UUID assigned");
            String::new()
        });
        *self.exist_map.lock().expect("inventory lock poisoned") = fresh;
        *self.id.lock().expect("inventory lock poisoned") = uuid;
        Ok(())
    }

    /// Regenerate the store from the physical tables, then reload.
    pub async fn rebuild<S: MetaStore>(&self, store: &S) -> Result<(), MetaError> {
        store.rebuild().await?;
        self.init(store).await
    }
}

impl std::fmt::Debug for ChunkInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.exist_map();
        write!(f, "ChunkInventory({})", self.name)?;
        for (db, chunks) in &map {
            write!(f, " {db}: {chunks:?}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::meta::MemMetaStore;

    fn map(entries: &[(&str, &[i32])]) -> ExistMap {
        entries
            .iter()
            .map(|(db, chunks)| (db.to_string(), chunks.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn test_add_remove_idempotent() {
        let inv = ChunkInventory::new("test");
        inv.add("LSST", 31415);
        inv.add("LSST", 31415);
        assert!(inv.has("LSST", 31415));
        inv.remove("LSST", 31415);
        assert!(!inv.has("LSST", 31415));
        inv.remove("LSST", 31415);
        assert!(!inv.has("LSST", 31415));
        inv.remove("NoSuchDb", 1);
    }

    #[test]
    fn test_diff() {
        let a = map(&[("LSST", &[1, 2, 3]), ("SDSS", &[7])]);
        let b = map(&[("LSST", &[2])]);
        let d = diff(&a, &b);
        assert_eq!(d, map(&[("LSST", &[1, 3]), ("SDSS", &[7])]));
        assert!(diff(&b, &b).is_empty());
    }

    #[test]
    fn test_diff_union_identity() {
        // (A - B) plus (A ∩ B) reconstructs A.
        let a = map(&[("LSST", &[1, 2, 3])]);
        let b = map(&[("LSST", &[2, 4])]);
        let d = diff(&a, &b);
        let mut reconstructed = d.clone();
        for (db, chunks) in &a {
            if let Some(other) = b.get(db) {
                for c in chunks.intersection(other) {
                    reconstructed.entry(db.clone()).or_default().insert(*c);
                }
            }
        }
        assert_eq!(reconstructed, a);
    }

    #[tokio::test]
    async fn test_persistent_add_validates_database() {
        let store = MemMetaStore::new();
        let inv = ChunkInventory::new("test");
        let err = inv.add_persistent(&store, "LSST", 1).await.unwrap_err();
        assert!(matches!(err, MetaError::InvalidParam(_)));
        assert!(!inv.has("LSST", 1), "memory must not change when the store rejects");

        store.publish_db("LSST");
        inv.add_persistent(&store, "LSST", 1).await.unwrap();
        assert!(inv.has("LSST", 1));
        assert_eq!(store.chunks("LSST").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_init_loads_store_state() {
        let store = MemMetaStore::new();
        store.publish_db("LSST");
        store.seed_chunk("LSST", 7);
        store.seed_chunk("LSST", 8);
        store.set_uuid("abc-123");

        let inv = ChunkInventory::new("test");
        inv.init(&store).await.unwrap();
        assert!(inv.has("LSST", 7));
        assert!(inv.has("LSST", 8));
        assert_eq!(inv.id(), "abc-123");
    }

    #[tokio::test]
    async fn test_rebuild_from_physical_tables() {
        let store = MemMetaStore::new();
        store.publish_db("LSST");
        store.add_table("LSST", "Object_31415");
        store.add_table("LSST", "Source_31415");
        store.add_table("LSST", "Object_1234567890");
        store.add_table("LSST", "Source_1234567890");

        let inv = ChunkInventory::new("test");
        inv.rebuild(&store).await.unwrap();
        assert!(inv.has("LSST", 31415));
        assert!(inv.has("LSST", 1234567890));
        assert!(!inv.has("LSST", 123));
    }

    #[tokio::test]
    async fn test_add_then_rebuild_round_trip() {
        // A chunk added through the store survives a rebuild when its
        // physical table exists.
        let store = MemMetaStore::new();
        store.publish_db("LSST");
        store.add_table("LSST", "Object_31415");

        let inv = ChunkInventory::new("test");
        inv.add_persistent(&store, "LSST", 31415).await.unwrap();
        inv.rebuild(&store).await.unwrap();
        assert!(inv.has("LSST", 31415));
    }
}
