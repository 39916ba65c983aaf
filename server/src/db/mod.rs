pub mod meta;
pub mod replicas;
pub mod transactions;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Pool};

pub type DbPool = Pool<MySql>;

/// Name of the worker metadata schema for an instance.
pub fn worker_schema(instance: &str) -> String {
    format!("qservw_{instance}")
}

/// The chunk ID column every chunked table carries.
pub const CHUNK_COLUMN: &str = "chunkId";
/// The sub-chunk ID column every chunked table carries.
pub const SUB_CHUNK_COLUMN: &str = "subChunkId";
/// The super-transaction partition column of director index tables.
pub const TRANSACTION_COLUMN: &str = "qserv_trans_id";

/// Quote an SQL identifier. Embedded backticks are doubled per the
/// MySQL quoting rules.
pub fn sql_id(id: &str) -> String {
    format!("`{}`", id.replace('`', "``"))
}

/// Quote an SQL string literal.
pub fn sql_str(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Create a database connection pool.
pub async fn create_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let pool = MySqlPoolOptions::new().max_connections(10).connect(database_url).await?;
    Ok(pool)
}

/// Create the worker metadata schema and its relations when missing.
/// Idempotent; run at startup and by the `migrate` subcommand.
pub async fn bootstrap(pool: &DbPool, instance: &str) -> anyhow::Result<()> {
    let schema = sql_id(&worker_schema(instance));
    let statements = [
        format!("CREATE DATABASE IF NOT EXISTS {schema}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.Dbs (
                db VARCHAR(200) NOT NULL,
                PRIMARY KEY (db)
            ) ENGINE=InnoDB"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.Chunks (
                db VARCHAR(200) NOT NULL,
                chunk INT NOT NULL,
                KEY (db, chunk)
            ) ENGINE=InnoDB"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.Id (
                `type` VARCHAR(64) NOT NULL,
                id VARCHAR(64) NOT NULL,
                created TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (`type`)
            ) ENGINE=InnoDB"
        ),
        format!("INSERT IGNORE INTO {schema}.Id (`type`, id) VALUES ('UUID', UUID())"),
    ];
    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(instance, "worker metadata schema ready");
    Ok(())
}

/// Create the controller metadata schema: the replica catalog, the
/// ingest contribution history, and the director table registry.
/// Director index tables are created in the same schema by the index
/// build endpoint.
pub async fn bootstrap_controller(pool: &DbPool) -> anyhow::Result<()> {
    let statements = [
        "CREATE DATABASE IF NOT EXISTS skymap".to_string(),
        "CREATE TABLE IF NOT EXISTS skymap.Replicas (
            db VARCHAR(200) NOT NULL,
            table_name VARCHAR(200) NOT NULL,
            chunk INT UNSIGNED NOT NULL,
            worker VARCHAR(200) NOT NULL,
            KEY (db, table_name, chunk)
        ) ENGINE=InnoDB"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS skymap.TransContrib (
            db VARCHAR(200) NOT NULL,
            table_name VARCHAR(200) NOT NULL,
            transaction_id INT UNSIGNED NOT NULL,
            chunk INT UNSIGNED NOT NULL,
            worker VARCHAR(200) NOT NULL,
            KEY (db, table_name, transaction_id)
        ) ENGINE=InnoDB"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS skymap.DirectorTables (
            db VARCHAR(200) NOT NULL,
            table_name VARCHAR(200) NOT NULL,
            key_column VARCHAR(200) NOT NULL,
            is_published BOOLEAN NOT NULL DEFAULT FALSE,
            PRIMARY KEY (db, table_name)
        ) ENGINE=InnoDB"
            .to_string(),
    ];
    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("controller metadata schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_schema_name() {
        assert_eq!(worker_schema("test"), "qservw_test");
    }

    #[test]
    fn test_sql_id_quoting() {
        assert_eq!(sql_id("Chunks"), "`Chunks`");
        assert_eq!(sql_id("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_sql_str_quoting() {
        assert_eq!(sql_str("plain"), "'plain'");
        assert_eq!(sql_str("it's"), r"'it\'s'");
        assert_eq!(sql_str(r"back\slash"), r"'back\\slash'");
    }
}
