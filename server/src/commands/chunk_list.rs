//! Whole-inventory commands: reload, rebuild, atomic set, and get.

use super::dispatcher::{resource_path, Dispatcher};
use super::{annotate, ChunkListReply, ChunkUse, CommandStatus, GetChunkListReply, SetChunkListReply};
use crate::db::meta::{MetaError, MetaStore};
use crate::inventory::monitor::ResourceMonitor;
use crate::inventory::{diff, ChunkInventory, ExistMap};

/// Reload the inventory from the persistent store, applying and
/// reporting the deltas: chunks present only in the store are added,
/// chunks present only in memory are removed. Each delta notifies the
/// dispatcher before the in-memory mutation.
pub async fn reload_chunk_list<S: MetaStore>(
    inventory: &ChunkInventory,
    store: &S,
    monitor: &ResourceMonitor,
    dispatcher: &dyn Dispatcher,
) -> ChunkListReply {
    // Load the fresh state into a throwaway inventory so a failure
    // leaves the live one untouched.
    let fresh = ChunkInventory::new(inventory.name());
    if let Err(e) = fresh.init(store).await {
        return ChunkListReply::failed(CommandStatus::Error, format!("database operation failed: {e}"));
    }
    let current_map = inventory.exist_map();
    let fresh_map = fresh.exist_map();
    tracing::debug!(current = ?current_map, fresh = ?fresh_map, "reloading the chunk list");

    let removed_map = diff(&current_map, &fresh_map);
    let added_map = diff(&fresh_map, &current_map);

    let removed = apply_removals(inventory, monitor, dispatcher, &removed_map);
    let added = apply_additions(inventory, monitor, dispatcher, &added_map);
    ChunkListReply { status: CommandStatus::Success, error: String::new(), added, removed }
}

/// Regenerate the persistent chunk list from the physical tables, then
/// optionally reload the in-memory inventory from it.
pub async fn rebuild_chunk_list<S: MetaStore>(
    inventory: &ChunkInventory,
    store: &S,
    monitor: &ResourceMonitor,
    dispatcher: &dyn Dispatcher,
    reload: bool,
) -> ChunkListReply {
    if let Err(e) = store.rebuild().await {
        return ChunkListReply::failed(CommandStatus::Error, format!("database operation failed: {e}"));
    }
    if reload {
        return reload_chunk_list(inventory, store, monitor, dispatcher).await;
    }
    ChunkListReply {
        status: CommandStatus::Success,
        error: String::new(),
        added: Vec::new(),
        removed: Vec::new(),
    }
}

/// Replace the inventory with the requested exact chunk list. Unless
/// forced, the command fails with `IN_USE` when any chunk that would
/// be removed has in-flight requests. Removals and additions go
/// through the persistent store. The reply always reports the
/// inventory as it was before the command.
pub async fn set_chunk_list<S: MetaStore>(
    inventory: &ChunkInventory,
    store: &S,
    monitor: &ResourceMonitor,
    dispatcher: &dyn Dispatcher,
    chunks: &[(String, i32)],
    force: bool,
) -> SetChunkListReply {
    let previous = inventory.exist_map();
    let previous_chunks = annotate(&previous, monitor);

    let mut requested = ExistMap::new();
    for (db, chunk) in chunks {
        requested.entry(db.clone()).or_default().insert(*chunk);
    }
    let to_remove = diff(&previous, &requested);
    let to_add = diff(&requested, &previous);

    if !force {
        for (db, chunks) in &to_remove {
            for &chunk in chunks {
                if monitor.count(chunk, db) > 0 {
                    tracing::error!(db, chunk, "refusing to remove a chunk in use");
                    return SetChunkListReply {
                        status: CommandStatus::InUse,
                        error: "some chunks of the group are in use".to_string(),
                        chunks: previous_chunks,
                    };
                }
            }
        }
    }
    for (db, chunks) in &to_remove {
        for &chunk in chunks {
            tracing::debug!(resource = %resource_path(db, chunk), "removing the chunk resource");
            dispatcher.resource_removed(db, chunk);
            if let Err(e) = inventory.remove_persistent(store, db, chunk).await {
                return set_failure(e, previous_chunks);
            }
        }
    }
    for (db, chunks) in &to_add {
        for &chunk in chunks {
            tracing::debug!(resource = %resource_path(db, chunk), "adding the chunk resource");
            dispatcher.resource_added(db, chunk);
            if let Err(e) = inventory.add_persistent(store, db, chunk).await {
                return set_failure(e, previous_chunks);
            }
        }
    }
    SetChunkListReply {
        status: CommandStatus::Success,
        error: String::new(),
        chunks: previous_chunks,
    }
}

/// The current inventory, annotated with in-use counts.
pub fn get_chunk_list(
    inventory: &ChunkInventory,
    monitor: &ResourceMonitor,
) -> GetChunkListReply {
    GetChunkListReply {
        status: CommandStatus::Success,
        chunks: annotate(&inventory.exist_map(), monitor),
    }
}

fn set_failure(e: MetaError, previous_chunks: Vec<ChunkUse>) -> SetChunkListReply {
    let status = match e {
        MetaError::InvalidParam(_) => CommandStatus::Invalid,
        MetaError::Query(_) => CommandStatus::Error,
    };
    tracing::error!(?status, error = %e, "set chunk list failed mid-delta");
    SetChunkListReply { status, error: e.to_string(), chunks: previous_chunks }
}

fn apply_removals(
    inventory: &ChunkInventory,
    monitor: &ResourceMonitor,
    dispatcher: &dyn Dispatcher,
    removed: &ExistMap,
) -> Vec<ChunkUse> {
    let mut entries = Vec::new();
    for (db, chunks) in removed {
        for &chunk in chunks {
            tracing::debug!(resource = %resource_path(db, chunk), "removing the chunk resource");
            dispatcher.resource_removed(db, chunk);
            inventory.remove(db, chunk);
            entries.push(ChunkUse { db: db.clone(), chunk, use_count: monitor.count(chunk, db) });
        }
    }
    entries
}

fn apply_additions(
    inventory: &ChunkInventory,
    monitor: &ResourceMonitor,
    dispatcher: &dyn Dispatcher,
    added: &ExistMap,
) -> Vec<ChunkUse> {
    let mut entries = Vec::new();
    for (db, chunks) in added {
        for &chunk in chunks {
            tracing::debug!(resource = %resource_path(db, chunk), "adding the chunk resource");
            dispatcher.resource_added(db, chunk);
            inventory.add(db, chunk);
            entries.push(ChunkUse { db: db.clone(), chunk, use_count: monitor.count(chunk, db) });
        }
    }
    entries
}
