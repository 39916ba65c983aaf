//! The dispatcher-fabric notification seam.
//!
//! The request-routing fabric must learn when a `(database, chunk)`
//! resource appears on or disappears from a worker, and it must learn
//! about removals *before* the worker stops claiming the resource, so
//! queries are never routed to a chunk the worker no longer owns.
//! Commands receive the dispatcher as an explicit collaborator; tests
//! substitute a recording implementation.

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// The advertised name of a chunk resource.
pub fn resource_path(db: &str, chunk: i32) -> String {
    format!("/chk/{db}/{chunk}")
}

pub trait Dispatcher: Send + Sync {
    fn resource_added(&self, db: &str, chunk: i32);
    fn resource_removed(&self, db: &str, chunk: i32);
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceEvent {
    pub resource: String,
    pub added: bool,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Production dispatcher: logs and broadcasts resource events to any
/// connected fabric listeners.
pub struct ClusterDispatcher {
    events: broadcast::Sender<ResourceEvent>,
}

impl ClusterDispatcher {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        ClusterDispatcher { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    fn publish(&self, db: &str, chunk: i32, added: bool) {
        let event =
            ResourceEvent { resource: resource_path(db, chunk), added, at: chrono::Utc::now() };
        tracing::debug!(resource = %event.resource, added, "dispatcher notification");
        // A send only fails when no listener is connected, which is
        // normal for a standalone worker.
        let _ = self.events.send(event);
    }
}

impl Default for ClusterDispatcher {
    fn default() -> Self {
        ClusterDispatcher::new()
    }
}

impl Dispatcher for ClusterDispatcher {
    fn resource_added(&self, db: &str, chunk: i32) {
        self.publish(db, chunk, true);
    }

    fn resource_removed(&self, db: &str, chunk: i32) {
        self.publish(db, chunk, false);
    }
}

/// Records notifications in order; used by tests to check the
/// notify-before-mutate contract.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub events: Mutex<Vec<ResourceEvent>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        RecordingDispatcher::default()
    }

    pub fn resources(&self, added: bool) -> Vec<String> {
        self.events
            .lock()
            .expect("recording dispatcher lock poisoned")
            .iter()
            .filter(|e| e.added == added)
            .map(|e| e.resource.clone())
            .collect()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn resource_added(&self, db: &str, chunk: i32) {
        self.events
            .lock()
            .expect("recording dispatcher lock poisoned")
            .push(ResourceEvent {
                resource: resource_path(db, chunk),
                added: true,
                at: chrono::Utc::now(),
            });
    }

    fn resource_removed(&self, db: &str, chunk: i32) {
        self.events
            .lock()
            .expect("recording dispatcher lock poisoned")
            .push(ResourceEvent {
                resource: resource_path(db, chunk),
                added: false,
                at: chrono::Utc::now(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_path() {
        assert_eq!(resource_path("LSST", 31415), "/chk/LSST/31415");
    }

    #[tokio::test]
    async fn test_cluster_dispatcher_broadcasts() {
        let d = ClusterDispatcher::new();
        let mut rx = d.subscribe();
        d.resource_added("LSST", 1);
        d.resource_removed("LSST", 1);
        let e1 = rx.recv().await.unwrap();
        assert!(e1.added);
        assert_eq!(e1.resource, "/chk/LSST/1");
        let e2 = rx.recv().await.unwrap();
        assert!(!e2.added);
    }
}
