//! Chunk-lifecycle commands.
//!
//! Each command mutates the chunk inventory, notifies the dispatcher
//! fabric, and produces a typed reply carrying a status code, an error
//! message when applicable, and the affected `(db, chunk)` resources
//! with their in-use counts. All commands are idempotent. Within any
//! command the dispatcher is notified *before* the memory and
//! persistent mutation, so the fabric never routes queries to a chunk
//! the worker still claims but is about to drop.

pub mod chunk_group;
pub mod chunk_list;
pub mod dispatcher;
pub mod echo;

use crate::inventory::monitor::ResourceMonitor;
use crate::inventory::ExistMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Success,
    /// Malformed request: empty database list, unknown database.
    Invalid,
    /// Backing-store failure.
    Error,
    /// A non-forced removal targeted a chunk with in-flight requests.
    InUse,
}

/// One affected resource, annotated with its in-flight request count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUse {
    pub db: String,
    pub chunk: i32,
    pub use_count: u32,
}

/// Flatten an exist map into annotated `(db, chunk)` entries.
pub fn annotate(map: &ExistMap, monitor: &ResourceMonitor) -> Vec<ChunkUse> {
    let mut entries = Vec::new();
    for (db, chunks) in map {
        for &chunk in chunks {
            entries.push(ChunkUse {
                db: db.clone(),
                chunk,
                use_count: monitor.count(chunk, db),
            });
        }
    }
    entries
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkGroupReply {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ChunkGroupReply {
    pub fn success() -> Self {
        ChunkGroupReply { status: CommandStatus::Success, error: String::new() }
    }

    pub fn failed(status: CommandStatus, error: impl Into<String>) -> Self {
        let error = error.into();
        tracing::error!(?status, error, "chunk group command failed");
        ChunkGroupReply { status, error }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkListReply {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Resources added to the inventory by this command.
    pub added: Vec<ChunkUse>,
    /// Resources removed from the inventory by this command.
    pub removed: Vec<ChunkUse>,
}

impl ChunkListReply {
    pub fn failed(status: CommandStatus, error: impl Into<String>) -> Self {
        let error = error.into();
        tracing::error!(?status, error, "chunk list command failed");
        ChunkListReply { status, error, added: Vec::new(), removed: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetChunkListReply {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// The inventory as it was before the command ran.
    pub chunks: Vec<ChunkUse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunkListReply {
    pub status: CommandStatus,
    pub chunks: Vec<ChunkUse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoReply {
    pub status: CommandStatus,
    pub data: String,
}
