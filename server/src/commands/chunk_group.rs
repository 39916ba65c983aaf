//! Add and remove a chunk group: one chunk across a list of databases.

use super::dispatcher::{resource_path, Dispatcher};
use super::{ChunkGroupReply, CommandStatus};
use crate::db::meta::{MetaError, MetaStore};
use crate::inventory::monitor::ResourceMonitor;
use crate::inventory::ChunkInventory;

/// Register `chunk` for every database in `dbs`, in the persistent
/// store and in memory, and advertise each new resource to the
/// dispatcher.
pub async fn add_chunk_group<S: MetaStore>(
    inventory: &ChunkInventory,
    store: &S,
    dispatcher: &dyn Dispatcher,
    chunk: i32,
    dbs: &[String],
) -> ChunkGroupReply {
    if dbs.is_empty() {
        return ChunkGroupReply::failed(
            CommandStatus::Invalid,
            "the list of database names in the group is empty",
        );
    }
    for db in dbs {
        tracing::debug!(resource = %resource_path(db, chunk), "adding the chunk resource");
        dispatcher.resource_added(db, chunk);
        match inventory.add_persistent(store, db, chunk).await {
            Ok(()) => {}
            Err(MetaError::InvalidParam(message)) => {
                return ChunkGroupReply::failed(CommandStatus::Invalid, message);
            }
            Err(MetaError::Query(message)) => {
                return ChunkGroupReply::failed(CommandStatus::Error, message);
            }
        }
    }
    ChunkGroupReply::success()
}

/// Remove `chunk` from every database in `dbs`. Unless forced, the
/// command refuses to touch a chunk with in-flight requests. After a
/// removal the in-use count is re-checked: a request may have arrived
/// while the group was being processed, in which case the reply is
/// `IN_USE` even though the resources were removed; the caller
/// interprets that against its own `force` intent.
pub async fn remove_chunk_group<S: MetaStore>(
    inventory: &ChunkInventory,
    store: &S,
    monitor: &ResourceMonitor,
    dispatcher: &dyn Dispatcher,
    chunk: i32,
    dbs: &[String],
    force: bool,
) -> ChunkGroupReply {
    if dbs.is_empty() {
        return ChunkGroupReply::failed(
            CommandStatus::Invalid,
            "the list of database names in the group is empty",
        );
    }
    if !force && monitor.count_any(chunk, dbs) > 0 {
        return ChunkGroupReply::failed(CommandStatus::InUse, "some chunks of the group are in use");
    }
    for db in dbs {
        tracing::debug!(resource = %resource_path(db, chunk), "removing the chunk resource");
        dispatcher.resource_removed(db, chunk);
        match inventory.remove_persistent(store, db, chunk).await {
            Ok(()) => {}
            Err(MetaError::InvalidParam(message)) => {
                return ChunkGroupReply::failed(CommandStatus::Invalid, message);
            }
            Err(MetaError::Query(message)) => {
                return ChunkGroupReply::failed(CommandStatus::Error, message);
            }
        }
    }
    if monitor.count_any(chunk, dbs) > 0 {
        // The resources are gone from the inventory but requests that
        // were already dispatched still hold them.
        return ChunkGroupReply::failed(CommandStatus::InUse, "some chunks of the group are in use");
    }
    ChunkGroupReply::success()
}
