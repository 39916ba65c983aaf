//! The secondary-index build endpoint.
//!
//! `POST /ingest/build-secondary-index` (re)builds the director index
//! table of one or all director tables of a database: pre-screens the
//! director table schemas, creates the index tables, and runs one
//! index job per table with the TABLE destination. Schema problems
//! abort before any job is scheduled; job failures are reported with
//! per-table, per-worker, per-chunk sub-errors.

use super::error::AppError;
use crate::api::AppState;
use crate::db::{replicas, sql_id, transactions, CHUNK_COLUMN, SUB_CHUNK_COLUMN};
use crate::index::job::{IndexJob, IndexJobParams, JobOutcome};
use crate::index::sink::{IndexSink, TableSink, CONTROLLER_SCHEMA};
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Deserialize)]
pub struct BuildSecondaryIndexRequest {
    pub database: String,
    /// Restrict the build to one director table.
    #[serde(default)]
    pub director_table: Option<String>,
    /// Building the index of a published database is destructive to
    /// live queries; require an explicit override.
    #[serde(default)]
    pub allow_for_published: bool,
    /// Drop and recreate the index table first.
    #[serde(default)]
    pub rebuild: bool,
    /// Load with `LOAD DATA LOCAL INFILE`.
    #[serde(default)]
    pub local: bool,
    /// Restrict the build to one super-transaction's contributions.
    /// The index table must be transactional, and only the chunks that
    /// received writes in the transaction are scanned.
    #[serde(default)]
    pub transaction_id: Option<u32>,
    /// Lower the per-request timeout, e.g. to keep the call from
    /// hanging on unreachable workers.
    #[serde(default)]
    pub request_timeout_sec: Option<u64>,
}

#[derive(Debug, sqlx::FromRow)]
struct DirectorTable {
    table_name: String,
    key_column: String,
    is_published: bool,
}

pub async fn build_secondary_index(
    State(state): State<AppState>,
    Json(request): Json<BuildSecondaryIndexRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!(
        database = %request.database,
        director_table = request.director_table.as_deref().unwrap_or("<all>"),
        rebuild = request.rebuild,
        local = request.local,
        "secondary index build requested"
    );
    let directors = director_tables(&state, &request.database).await?;
    if directors.is_empty() {
        return Err(AppError::BadRequest(format!(
            "no director tables are configured for database '{}'",
            request.database
        )));
    }
    let directors: Vec<DirectorTable> = match &request.director_table {
        Some(table) => {
            let found: Vec<DirectorTable> =
                directors.into_iter().filter(|d| &d.table_name == table).collect();
            if found.is_empty() {
                return Err(AppError::BadRequest(format!(
                    "table '{table}' is not configured as a director table in database '{}'",
                    request.database
                )));
            }
            found
        }
        None => directors,
    };
    for director in &directors {
        if director.is_published && !request.allow_for_published {
            return Err(AppError::BadRequest(format!(
                "database '{}' is already published; use 'allow_for_published' to override",
                request.database
            )));
        }
        if director.key_column.is_empty() {
            return Err(AppError::BadRequest(format!(
                "director table '{}' has no key column configured",
                director.table_name
            )));
        }
    }

    // Pre-screen the director table schemas before scheduling
    // anything: the index table columns inherit their types.
    let mut screened = Vec::with_capacity(directors.len());
    for director in &directors {
        let key_type =
            column_type(&state, &request.database, &director.table_name, &director.key_column)
                .await?;
        let sub_chunk_type =
            column_type(&state, &request.database, &director.table_name, SUB_CHUNK_COLUMN).await?;
        match (key_type, sub_chunk_type) {
            (Some(key_type), Some(sub_chunk_type)) => {
                screened.push((director, key_type, sub_chunk_type));
            }
            _ => {
                return Err(AppError::BadRequest(format!(
                    "column definitions for the director key or sub-chunk identifier are \
                     missing in the schema of director table '{}' of database '{}'",
                    director.table_name, request.database
                )));
            }
        }
    }

    let timeout = Duration::from_secs(
        request.request_timeout_sec.unwrap_or(state.config.request_timeout_secs),
    );
    let mut extended = serde_json::Map::new();
    let mut failed = false;
    for (director, key_type, sub_chunk_type) in screened {
        let index_table = format!("{}__{}", request.database, director.table_name);
        create_index_table(
            &state,
            &index_table,
            &director.key_column,
            &key_type,
            &sub_chunk_type,
            request.rebuild,
            request.transaction_id.is_some(),
        )
        .await?;

        // Transactional builds touch only the chunks that received
        // writes within the transaction, and land in its partition.
        let scan = match request.transaction_id {
            Some(id) => {
                transactions::add_partition(&state.db, &index_table, id).await?;
                replicas::transaction_replicas(
                    &state.db,
                    &request.database,
                    &director.table_name,
                    id,
                )
                .await?
            }
            None => {
                replicas::global_replicas(&state.db, &request.database, &director.table_name)
                    .await?
            }
        };
        let params = IndexJobParams {
            database: request.database.clone(),
            director_table: director.table_name.clone(),
            key_column: director.key_column.clone(),
            transaction_id: request.transaction_id,
            max_requests_per_worker: 8 * state.config.worker_threads,
            request_timeout: timeout,
        };
        let sink = IndexSink::Table(TableSink::new(
            &state.config.database_url,
            &index_table,
            request.local,
            &state.config.tmp_dir,
            request.transaction_id,
        ));
        let (outcome, result) =
            IndexJob::run(params, scan, state.workers.clone(), sink, watch::channel(false).1)
                .await;

        // The table's entry stays an empty object when the build
        // succeeded.
        let mut table_errors = serde_json::Map::new();
        if outcome != JobOutcome::Success {
            failed = true;
            for (worker, chunks) in &result.error {
                let worker_errors: serde_json::Map<String, serde_json::Value> = chunks
                    .iter()
                    .map(|(chunk, message)| (chunk.to_string(), message.clone().into()))
                    .collect();
                table_errors.insert(worker.clone(), worker_errors.into());
            }
        }
        extended.insert(director.table_name.clone(), table_errors.into());
    }
    if failed {
        return Err(AppError::Extended {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "index creation failed".to_string(),
            extended: extended.into(),
        });
    }
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
pub struct TransactionRequest {
    pub database: String,
    /// Restrict to one director table; all of the database's director
    /// index tables otherwise.
    #[serde(default)]
    pub director_table: Option<String>,
    pub transaction_id: u32,
}

/// Register a super-transaction: give it a partition in each director
/// index table. Idempotent per transaction.
pub async fn begin_transaction(
    State(state): State<AppState>,
    Json(request): Json<TransactionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    for table in transaction_index_tables(&state, &request).await? {
        transactions::begin_transaction(&state.db, &table, request.transaction_id).await?;
    }
    Ok(Json(serde_json::json!({ "transaction_id": request.transaction_id })))
}

/// Abort a super-transaction: drop its partition from each director
/// index table, discarding every row it contributed. A transaction
/// that never contributed is not an error.
pub async fn abort_transaction(
    State(state): State<AppState>,
    Json(request): Json<TransactionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    for table in transaction_index_tables(&state, &request).await? {
        transactions::abort_transaction(&state.db, &table, request.transaction_id).await?;
    }
    tracing::info!(
        database = %request.database,
        transaction_id = request.transaction_id,
        "aborted the ingest transaction"
    );
    Ok(Json(serde_json::json!({ "transaction_id": request.transaction_id })))
}

async fn transaction_index_tables(
    state: &AppState,
    request: &TransactionRequest,
) -> Result<Vec<String>, AppError> {
    let directors = director_tables(state, &request.database).await?;
    let tables: Vec<String> = directors
        .iter()
        .filter(|d| {
            request.director_table.as_ref().map(|t| t == &d.table_name).unwrap_or(true)
        })
        .map(|d| format!("{}__{}", request.database, d.table_name))
        .collect();
    if tables.is_empty() {
        return Err(AppError::BadRequest(format!(
            "no director tables match in database '{}'",
            request.database
        )));
    }
    Ok(tables)
}

async fn director_tables(
    state: &AppState,
    database: &str,
) -> Result<Vec<DirectorTable>, AppError> {
    let tables: Vec<DirectorTable> = sqlx::query_as(
        r#"
        SELECT table_name, key_column, is_published
        FROM skymap.DirectorTables
        WHERE db = ?
        "#,
    )
    .bind(database)
    .fetch_all(&state.db)
    .await?;
    Ok(tables)
}

/// The declared type of a column of a physical table, from the
/// server's data dictionary.
async fn column_type(
    state: &AppState,
    database: &str,
    table: &str,
    column: &str,
) -> Result<Option<String>, AppError> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT COLUMN_TYPE
        FROM information_schema.columns
        WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND COLUMN_NAME = ?
        "#,
    )
    .bind(database)
    .bind(table)
    .bind(column)
    .fetch_optional(&state.db)
    .await?;
    Ok(row.map(|(column_type,)| column_type))
}

#[allow(clippy::too_many_arguments)]
async fn create_index_table(
    state: &AppState,
    index_table: &str,
    key_column: &str,
    key_type: &str,
    sub_chunk_type: &str,
    rebuild: bool,
    transactional: bool,
) -> Result<(), AppError> {
    let qualified = format!("{}.{}", sql_id(CONTROLLER_SCHEMA), sql_id(index_table));
    if rebuild {
        sqlx::query(&format!("DROP TABLE IF EXISTS {qualified}"))
            .execute(&state.db)
            .await?;
    } else if transactional && table_exists(state, index_table).await? {
        // Transactional builds extend an existing index one partition
        // at a time.
        return Ok(());
    }
    // Written so it fails when the table already exists: overwriting
    // an index that was not asked to be rebuilt loses data. A
    // transactional index carries the transaction column and is list
    // partitioned by it, so an abort can drop its partition.
    // Every unique key of a partitioned MySQL table must include the
    // partitioning column.
    let (transaction_column, unique) = if transactional {
        let trans = sql_id(crate::db::TRANSACTION_COLUMN);
        (
            format!("{trans} INT UNSIGNED NOT NULL,\n            "),
            format!("{}, {trans}", sql_id(key_column)),
        )
    } else {
        (String::new(), sql_id(key_column))
    };
    let create = format!(
        "CREATE TABLE {qualified} (
            {key} {key_type},
            {chunk} INT,
            {sub_chunk} {sub_chunk_type},
            {transaction_column}UNIQUE KEY ({unique}),
            KEY ({key})
        ) ENGINE=InnoDB{partitioning}",
        key = sql_id(key_column),
        chunk = sql_id(CHUNK_COLUMN),
        sub_chunk = sql_id(SUB_CHUNK_COLUMN),
        partitioning =
            if transactional { transactions::partition_by_clause() } else { String::new() },
    );
    sqlx::query(&create).execute(&state.db).await?;
    tracing::info!(index_table, "created the director index table");
    Ok(())
}

async fn table_exists(state: &AppState, table: &str) -> Result<bool, AppError> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT TABLE_NAME
        FROM information_schema.tables
        WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        "#,
    )
    .bind(CONTROLLER_SCHEMA)
    .bind(table)
    .fetch_optional(&state.db)
    .await?;
    Ok(row.is_some())
}
