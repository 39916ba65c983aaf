pub mod rest;

use crate::commands::dispatcher::Dispatcher;
use crate::config::Config;
use crate::db::meta::SqlMetaStore;
use crate::db::DbPool;
use crate::index::request::HttpWorkerService;
use crate::inventory::monitor::ResourceMonitor;
use crate::inventory::ChunkInventory;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Config,
    /// The chunk resources this worker advertises.
    pub inventory: Arc<ChunkInventory>,
    pub store: Arc<SqlMetaStore>,
    /// In-flight request counts per resource.
    pub monitor: Arc<ResourceMonitor>,
    /// The cluster routing fabric notification channel.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Controller-side transport to the worker fleet.
    pub workers: Arc<HttpWorkerService>,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: Config,
        inventory: Arc<ChunkInventory>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let store = Arc::new(SqlMetaStore::new(db.clone(), &config.instance_name));
        let workers = Arc::new(HttpWorkerService::new(config.workers.clone()));
        Self {
            db,
            config,
            inventory,
            store,
            monitor: Arc::new(ResourceMonitor::new()),
            dispatcher,
            workers,
        }
    }
}
