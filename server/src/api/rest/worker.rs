//! Worker-side index data extraction.
//!
//! The controller posts per-chunk extraction requests here; the worker
//! reads the director chunk table and streams back the
//! `(key, chunkId, subChunkId)` rows as TSV. Extraction is served
//! synchronously, so a status poll can only ever find an unknown
//! request, and a stop is an acknowledgment.

use crate::api::AppState;
use crate::db::{sql_id, CHUNK_COLUMN, SUB_CHUNK_COLUMN};
use crate::index::request::{IndexDataRequest, WorkerIndexResponse, WorkerIndexStatus};
use crate::inventory::monitor::ResourceGuard;
use axum::extract::{Path, State};
use axum::Json;
use sqlx::mysql::MySqlDatabaseError;
use uuid::Uuid;

// Selecting from a missing list partition.
const ER_UNKNOWN_PARTITION: u16 = 1735;
// Selecting from a missing table.
const ER_NO_SUCH_TABLE: u16 = 1146;

pub async fn index_data(
    State(state): State<AppState>,
    Json(request): Json<IndexDataRequest>,
) -> Json<WorkerIndexResponse> {
    let chunk = request.chunk as i32;
    if !state.inventory.has(&request.database, chunk) {
        return Json(WorkerIndexResponse::failed(
            WorkerIndexStatus::Bad,
            format!("chunk {} of database '{}' is not hosted here", chunk, request.database),
        ));
    }
    // Hold the resource for the duration of the extraction so a
    // concurrent non-forced removal is refused.
    let _guard = ResourceGuard::acquire(state.monitor.clone(), request.database.clone(), chunk);

    let chunk_table = format!("{}_{}", request.director_table, request.chunk);
    let partition = match request.transaction_id {
        Some(id) => format!(" PARTITION ({})", sql_id(&format!("p{id}"))),
        None => String::new(),
    };
    // One TSV row per record; the key is rendered by the server so its
    // SQL type does not matter here. A transactional extraction also
    // carries the transaction ID for the partitioned index table.
    let columns = match request.transaction_id {
        Some(id) => format!(
            "CONCAT_WS('\\t', {}, {}, {}, {id})",
            sql_id(&request.key_column),
            sql_id(CHUNK_COLUMN),
            sql_id(SUB_CHUNK_COLUMN),
        ),
        None => format!(
            "CONCAT_WS('\\t', {}, {}, {})",
            sql_id(&request.key_column),
            sql_id(CHUNK_COLUMN),
            sql_id(SUB_CHUNK_COLUMN),
        ),
    };
    let query = format!(
        "SELECT {columns} FROM {}.{}{partition}",
        sql_id(&request.database),
        sql_id(&chunk_table),
    );
    tracing::debug!(%query, "extracting index data");

    let rows: Result<Vec<String>, sqlx::Error> =
        sqlx::query_scalar(&query).fetch_all(&state.db).await;
    match rows {
        Ok(rows) => {
            let mut data = String::with_capacity(rows.iter().map(|r| r.len() + 1).sum());
            for row in rows {
                data.push_str(&row);
                data.push('\n');
            }
            Json(WorkerIndexResponse::success(data))
        }
        Err(e) => {
            let number = e
                .as_database_error()
                .and_then(|d| d.try_downcast_ref::<MySqlDatabaseError>())
                .map(|d| d.number());
            let status = match number {
                Some(ER_UNKNOWN_PARTITION) => WorkerIndexStatus::NoSuchPartition,
                Some(ER_NO_SUCH_TABLE) => WorkerIndexStatus::Bad,
                _ => WorkerIndexStatus::Error,
            };
            tracing::warn!(chunk_table, ?status, "index data extraction failed: {e}");
            Json(WorkerIndexResponse::failed(status, e.to_string()))
        }
    }
}

pub async fn request_status(Path(request_id): Path<Uuid>) -> Json<WorkerIndexResponse> {
    Json(WorkerIndexResponse::failed(
        WorkerIndexStatus::Error,
        format!("unknown request {request_id}"),
    ))
}

pub async fn stop_request(Path(request_id): Path<Uuid>) -> Json<serde_json::Value> {
    tracing::debug!(%request_id, "stop requested for an index extraction");
    Json(serde_json::json!({ "stopped": request_id }))
}
