//! Super-transaction partition management for director index tables.
//!
//! Every in-flight ingest transaction owns exactly one MySQL list
//! partition `p<transactionId>` of the index table, keyed by the
//! `qserv_trans_id` column. Aborting a transaction drops the
//! partition, which cleanly discards all of its rows; committing
//! leaves the partition in place.

use super::{sql_id, DbPool, TRANSACTION_COLUMN};
use sqlx::mysql::MySqlDatabaseError;

// MySQL error numbers tolerated by the idempotent partition
// operations.
const ER_SAME_NAME_PARTITION: u16 = 1517;
const ER_DROP_PARTITION_NON_EXISTENT: u16 = 1507;

fn mysql_error_number(e: &sqlx::Error) -> Option<u16> {
    e.as_database_error()
        .and_then(|d| d.try_downcast_ref::<MySqlDatabaseError>())
        .map(|d| d.number())
}

/// Add the partition of a transaction to an index table. Idempotent:
/// the partition already existing is not an error.
pub async fn add_partition(
    pool: &DbPool,
    index_table: &str,
    transaction_id: u32,
) -> anyhow::Result<()> {
    let query = format!(
        "ALTER TABLE {} ADD PARTITION (PARTITION {} VALUES IN ({transaction_id}))",
        sql_id(index_table),
        sql_id(&format!("p{transaction_id}")),
    );
    match sqlx::query(&query).execute(pool).await {
        Ok(_) => Ok(()),
        Err(e) if mysql_error_number(&e) == Some(ER_SAME_NAME_PARTITION) => {
            tracing::debug!(index_table, transaction_id, "partition already present");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Drop the partition of a transaction from an index table. A
/// non-existent partition is not an error: the transaction may not
/// have contributed any rows.
pub async fn drop_partition(
    pool: &DbPool,
    index_table: &str,
    transaction_id: u32,
) -> anyhow::Result<()> {
    let query = format!(
        "ALTER TABLE {} DROP PARTITION {}",
        sql_id(index_table),
        sql_id(&format!("p{transaction_id}")),
    );
    match sqlx::query(&query).execute(pool).await {
        Ok(_) => Ok(()),
        Err(e) if mysql_error_number(&e) == Some(ER_DROP_PARTITION_NON_EXISTENT) => {
            tracing::debug!(index_table, transaction_id, "partition was not present");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Register a new ingest transaction with an index table.
pub async fn begin_transaction(
    pool: &DbPool,
    index_table: &str,
    transaction_id: u32,
) -> anyhow::Result<()> {
    add_partition(pool, index_table, transaction_id).await
}

/// Abort an ingest transaction: all of its rows disappear with the
/// partition.
pub async fn abort_transaction(
    pool: &DbPool,
    index_table: &str,
    transaction_id: u32,
) -> anyhow::Result<()> {
    drop_partition(pool, index_table, transaction_id).await
}

/// The partition clause appended to a transactional index table's
/// creation statement.
pub fn partition_by_clause() -> String {
    format!(" PARTITION BY LIST ({}) (PARTITION `p0` VALUES IN (0))", sql_id(TRANSACTION_COLUMN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_by_clause_names_the_transaction_column() {
        let clause = partition_by_clause();
        assert!(clause.contains("`qserv_trans_id`"));
        assert!(clause.contains("PARTITION BY LIST"));
    }
}
