//! Chunk lifecycle command endpoints.
//!
//! Thin wrappers: each endpoint deserializes a request, runs the
//! corresponding command against the worker's collaborators, and
//! returns the command's typed reply. Failures are reported through
//! the reply's status field, not HTTP status codes, since a rejected
//! command (IN_USE, INVALID) is a well-formed outcome.

use crate::api::AppState;
use crate::commands::{chunk_group, chunk_list, echo};
use axum::extract::State;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ChunkGroupRequest {
    pub chunk: i32,
    pub dbs: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn add_group(
    State(state): State<AppState>,
    Json(request): Json<ChunkGroupRequest>,
) -> Json<crate::commands::ChunkGroupReply> {
    Json(
        chunk_group::add_chunk_group(
            &state.inventory,
            state.store.as_ref(),
            state.dispatcher.as_ref(),
            request.chunk,
            &request.dbs,
        )
        .await,
    )
}

pub async fn remove_group(
    State(state): State<AppState>,
    Json(request): Json<ChunkGroupRequest>,
) -> Json<crate::commands::ChunkGroupReply> {
    Json(
        chunk_group::remove_chunk_group(
            &state.inventory,
            state.store.as_ref(),
            &state.monitor,
            state.dispatcher.as_ref(),
            request.chunk,
            &request.dbs,
            request.force,
        )
        .await,
    )
}

pub async fn reload(State(state): State<AppState>) -> Json<crate::commands::ChunkListReply> {
    Json(
        chunk_list::reload_chunk_list(
            &state.inventory,
            state.store.as_ref(),
            &state.monitor,
            state.dispatcher.as_ref(),
        )
        .await,
    )
}

#[derive(Debug, Deserialize)]
pub struct RebuildRequest {
    /// Also reload the in-memory inventory after the rebuild.
    #[serde(default = "default_true")]
    pub reload: bool,
}

fn default_true() -> bool {
    true
}

pub async fn rebuild(
    State(state): State<AppState>,
    Json(request): Json<RebuildRequest>,
) -> Json<crate::commands::ChunkListReply> {
    Json(
        chunk_list::rebuild_chunk_list(
            &state.inventory,
            state.store.as_ref(),
            &state.monitor,
            state.dispatcher.as_ref(),
            request.reload,
        )
        .await,
    )
}

#[derive(Debug, Deserialize)]
pub struct SetChunkListRequest {
    pub chunks: Vec<ChunkEntry>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChunkEntry {
    pub db: String,
    pub chunk: i32,
}

pub async fn set(
    State(state): State<AppState>,
    Json(request): Json<SetChunkListRequest>,
) -> Json<crate::commands::SetChunkListReply> {
    let chunks: Vec<(String, i32)> =
        request.chunks.into_iter().map(|e| (e.db, e.chunk)).collect();
    Json(
        chunk_list::set_chunk_list(
            &state.inventory,
            state.store.as_ref(),
            &state.monitor,
            state.dispatcher.as_ref(),
            &chunks,
            request.force,
        )
        .await,
    )
}

pub async fn get(State(state): State<AppState>) -> Json<crate::commands::GetChunkListReply> {
    Json(chunk_list::get_chunk_list(&state.inventory, &state.monitor))
}

#[derive(Debug, Deserialize)]
pub struct EchoRequest {
    pub value: String,
}

pub async fn echo(Json(request): Json<EchoRequest>) -> Json<crate::commands::EchoReply> {
    Json(echo::test_echo(request.value))
}
