//! Replica scans feeding the index job planner.
//!
//! The controller keeps its replica catalog and ingest contribution
//! history in the `skymap` schema:
//!
//! ```text
//! skymap.Replicas(db, table_name, chunk, worker)
//! skymap.TransContrib(db, table_name, transaction_id, chunk, worker)
//! ```
//!
//! A scan produces, for every chunk of a director table, the workers
//! holding a replica of it.

use super::DbPool;
use std::collections::BTreeMap;

/// `chunk -> workers holding a replica`.
pub type ChunkReplicaMap = BTreeMap<u32, Vec<String>>;

/// All current replicas of a director table.
pub async fn global_replicas(
    pool: &DbPool,
    database: &str,
    table: &str,
) -> anyhow::Result<ChunkReplicaMap> {
    let rows: Vec<(u32, String)> = sqlx::query_as(
        r#"
        SELECT chunk, worker
        FROM skymap.Replicas
        WHERE db = ? AND table_name = ?
        "#,
    )
    .bind(database)
    .bind(table)
    .fetch_all(pool)
    .await?;
    Ok(collect(rows))
}

/// Replicas restricted to the chunks that received writes within one
/// super-transaction, per the ingest contribution history.
pub async fn transaction_replicas(
    pool: &DbPool,
    database: &str,
    table: &str,
    transaction_id: u32,
) -> anyhow::Result<ChunkReplicaMap> {
    let rows: Vec<(u32, String)> = sqlx::query_as(
        r#"
        SELECT DISTINCT c.chunk, r.worker
        FROM skymap.TransContrib c
        JOIN skymap.Replicas r
          ON r.db = c.db AND r.table_name = c.table_name AND r.chunk = c.chunk
        WHERE c.db = ? AND c.table_name = ? AND c.transaction_id = ?
        "#,
    )
    .bind(database)
    .bind(table)
    .bind(transaction_id)
    .fetch_all(pool)
    .await?;
    Ok(collect(rows))
}

fn collect(rows: Vec<(u32, String)>) -> ChunkReplicaMap {
    let mut map = ChunkReplicaMap::new();
    for (chunk, worker) in rows {
        map.entry(chunk).or_default().push(worker);
    }
    map
}
