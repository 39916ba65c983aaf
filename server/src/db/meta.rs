//! The worker metadata store behind the chunk inventory.
//!
//! Backing relations, in schema `qservw_<instance>`:
//!
//! ```text
//! Dbs(db)            -- databases published on this worker
//! Chunks(db, chunk)  -- chunks hosted for each database
//! Id(type, id)       -- worker identity; type 'UUID' is used
//! ```
//!
//! The `MetaStore` trait is the seam between the inventory and its
//! persistence: production code uses [`SqlMetaStore`], tests an
//! in-memory [`MemMetaStore`].

use super::{sql_id, sql_str, worker_schema, DbPool};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    /// A malformed request: unknown database, bad name. Permanent.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    /// A backing-store failure. May be retried externally.
    #[error("metadata query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for MetaError {
    fn from(e: sqlx::Error) -> Self {
        MetaError::Query(e.to_string())
    }
}

pub trait MetaStore: Send + Sync {
    /// The list of published databases.
    fn dbs(&self) -> impl std::future::Future<Output = Result<Vec<String>, MetaError>> + Send;

    /// The chunks published for a database.
    fn chunks(
        &self,
        db: &str,
    ) -> impl std::future::Future<Output = Result<Vec<i32>, MetaError>> + Send;

    /// The worker UUID, when one has been assigned.
    fn worker_uuid(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<String>, MetaError>> + Send;

    /// Register a chunk for a database. The database must already be
    /// published; fails with `InvalidParam` otherwise. Idempotent.
    fn add_chunk(
        &self,
        db: &str,
        chunk: i32,
    ) -> impl std::future::Future<Output = Result<(), MetaError>> + Send;

    /// Unregister a chunk. Unconditional and idempotent.
    fn remove_chunk(
        &self,
        db: &str,
        chunk: i32,
    ) -> impl std::future::Future<Output = Result<(), MetaError>> + Send;

    /// Regenerate `Chunks` from the physical tables present for the
    /// published databases: any table named `<base>_<chunkId>` counts.
    /// This is the ground-truth bootstrap after data is placed on the
    /// worker out of band.
    fn rebuild(&self) -> impl std::future::Future<Output = Result<(), MetaError>> + Send;
}

/// MySQL-backed store.
#[derive(Clone)]
pub struct SqlMetaStore {
    pool: DbPool,
    schema: String,
}

impl SqlMetaStore {
    pub fn new(pool: DbPool, instance: &str) -> Self {
        SqlMetaStore { pool, schema: worker_schema(instance) }
    }

    fn schema_id(&self) -> String {
        sql_id(&self.schema)
    }
}

impl MetaStore for SqlMetaStore {
    async fn dbs(&self) -> Result<Vec<String>, MetaError> {
        let rows: Vec<(String,)> =
            sqlx::query_as(&format!("SELECT db FROM {}.Dbs", self.schema_id()))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(db,)| db).collect())
    }

    async fn chunks(&self, db: &str) -> Result<Vec<i32>, MetaError> {
        let rows: Vec<(i32,)> =
            sqlx::query_as(&format!("SELECT chunk FROM {}.Chunks WHERE db = ?", self.schema_id()))
                .bind(db)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(chunk,)| chunk).collect())
    }

    async fn worker_uuid(&self) -> Result<Option<String>, MetaError> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM {}.Id WHERE `type` = 'UUID'",
            self.schema_id()
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn add_chunk(&self, db: &str, chunk: i32) -> Result<(), MetaError> {
        if !self.dbs().await?.iter().any(|d| d == db) {
            return Err(MetaError::InvalidParam(format!("unknown database: {db}")));
        }
        let schema = self.schema_id();
        let mut tx = self.pool.begin().await?;
        // Delete-then-insert keeps the operation idempotent without a
        // uniqueness constraint on (db, chunk).
        sqlx::query(&format!("DELETE FROM {schema}.Chunks WHERE db = ? AND chunk = ?"))
            .bind(db)
            .bind(chunk)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("INSERT INTO {schema}.Chunks (db, chunk) VALUES (?, ?)"))
            .bind(db)
            .bind(chunk)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_chunk(&self, db: &str, chunk: i32) -> Result<(), MetaError> {
        sqlx::query(&format!(
            "DELETE FROM {}.Chunks WHERE db = ? AND chunk = ?",
            self.schema_id()
        ))
        .bind(db)
        .bind(chunk)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rebuild(&self) -> Result<(), MetaError> {
        let schema = self.schema_id();
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {schema}.Chunks")).execute(&mut *tx).await?;
        sqlx::query(&format!(
            "INSERT INTO {schema}.Chunks
             SELECT DISTINCT TABLE_SCHEMA, SUBSTRING_INDEX(TABLE_NAME, '_', -1)
               FROM information_schema.tables
              WHERE TABLE_SCHEMA IN (SELECT db FROM {schema}.Dbs)
                AND TABLE_NAME REGEXP {}",
            sql_str("_[0-9]+$")
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!(schema = %self.schema, "rebuilt the published chunk list");
        Ok(())
    }
}

/// In-memory store for tests and local tooling. `tables` stands in for
/// the physical tables a rebuild scans.
#[derive(Default)]
pub struct MemMetaStore {
    state: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    dbs: BTreeSet<String>,
    chunks: BTreeMap<String, BTreeSet<i32>>,
    /// `(db, table name)` pairs standing in for physical tables.
    tables: Vec<(String, String)>,
    uuid: Option<String>,
}

impl MemMetaStore {
    pub fn new() -> Self {
        MemMetaStore::default()
    }

    pub fn publish_db(&self, db: &str) {
        self.state.lock().unwrap().dbs.insert(db.to_string());
    }

    pub fn set_uuid(&self, uuid: &str) {
        self.state.lock().unwrap().uuid = Some(uuid.to_string());
    }

    pub fn add_table(&self, db: &str, table: &str) {
        self.state.lock().unwrap().tables.push((db.to_string(), table.to_string()));
    }

    /// Seed a chunk row directly, bypassing the add validation.
    pub fn seed_chunk(&self, db: &str, chunk: i32) {
        self.state.lock().unwrap().chunks.entry(db.to_string()).or_default().insert(chunk);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap()
    }
}

impl MetaStore for MemMetaStore {
    async fn dbs(&self) -> Result<Vec<String>, MetaError> {
        Ok(self.lock().dbs.iter().cloned().collect())
    }

    async fn chunks(&self, db: &str) -> Result<Vec<i32>, MetaError> {
        Ok(self.lock().chunks.get(db).map(|c| c.iter().copied().collect()).unwrap_or_default())
    }

    async fn worker_uuid(&self) -> Result<Option<String>, MetaError> {
        Ok(self.lock().uuid.clone())
    }

    async fn add_chunk(&self, db: &str, chunk: i32) -> Result<(), MetaError> {
        let mut state = self.lock();
        if !state.dbs.contains(db) {
            return Err(MetaError::InvalidParam(format!("unknown database: {db}")));
        }
        state.chunks.entry(db.to_string()).or_default().insert(chunk);
        Ok(())
    }

    async fn remove_chunk(&self, db: &str, chunk: i32) -> Result<(), MetaError> {
        let mut state = self.lock();
        if let Some(chunks) = state.chunks.get_mut(db) {
            chunks.remove(&chunk);
        }
        Ok(())
    }

    async fn rebuild(&self) -> Result<(), MetaError> {
        let mut state = self.lock();
        state.chunks.clear();
        let mut rebuilt: BTreeMap<String, BTreeSet<i32>> = BTreeMap::new();
        for (db, table) in &state.tables {
            if !state.dbs.contains(db) {
                continue;
            }
            let Some((_, suffix)) = table.rsplit_once('_') else {
                continue;
            };
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(chunk) = suffix.parse() {
                    rebuilt.entry(db.clone()).or_default().insert(chunk);
                }
            }
        }
        state.chunks = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_store_add_validates_db() {
        let store = MemMetaStore::new();
        assert!(matches!(
            store.add_chunk("LSST", 1).await,
            Err(MetaError::InvalidParam(_))
        ));
        store.publish_db("LSST");
        store.add_chunk("LSST", 1).await.unwrap();
        assert_eq!(store.chunks("LSST").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_mem_store_remove_is_unconditional() {
        let store = MemMetaStore::new();
        store.remove_chunk("LSST", 1).await.unwrap();
        store.publish_db("LSST");
        store.add_chunk("LSST", 1).await.unwrap();
        store.remove_chunk("LSST", 1).await.unwrap();
        assert!(store.chunks("LSST").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mem_store_rebuild_scans_numbered_tables() {
        let store = MemMetaStore::new();
        store.publish_db("LSST");
        store.add_table("LSST", "Object_31415");
        store.add_table("LSST", "Source_31415");
        store.add_table("LSST", "Object_1234567890");
        store.add_table("LSST", "Source_1234567890");
        store.add_table("LSST", "Object");
        store.add_table("Other", "Object_99");
        store.rebuild().await.unwrap();
        let chunks = store.chunks("LSST").await.unwrap();
        assert_eq!(chunks, vec![31415, 1234567890]);
        assert!(store.chunks("Other").await.unwrap().is_empty());
    }
}
