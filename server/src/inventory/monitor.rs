//! Reference counts of in-flight requests per `(database, chunk)`.
//!
//! The query path increments a resource's count for the lifetime of
//! each request touching it; the chunk lifecycle commands consult the
//! counts to gate non-forced removals.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct ResourceMonitor {
    counts: Mutex<BTreeMap<(String, i32), u32>>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        ResourceMonitor::default()
    }

    pub fn increment(&self, db: &str, chunk: i32) {
        let mut counts = self.counts.lock().expect("resource monitor lock poisoned");
        *counts.entry((db.to_string(), chunk)).or_insert(0) += 1;
    }

    pub fn decrement(&self, db: &str, chunk: i32) {
        let mut counts = self.counts.lock().expect("resource monitor lock poisoned");
        match counts.get_mut(&(db.to_string(), chunk)) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(&(db.to_string(), chunk));
            }
            None => {
                tracing::warn!(db, chunk, "decrement of an untracked resource");
            }
        }
    }

    /// In-flight request count for one `(chunk, database)` resource.
    pub fn count(&self, chunk: i32, db: &str) -> u32 {
        let counts = self.counts.lock().expect("resource monitor lock poisoned");
        counts.get(&(db.to_string(), chunk)).copied().unwrap_or(0)
    }

    /// Total in-flight request count for a chunk across databases.
    pub fn count_any(&self, chunk: i32, dbs: &[String]) -> u32 {
        let counts = self.counts.lock().expect("resource monitor lock poisoned");
        dbs.iter().map(|db| counts.get(&(db.clone(), chunk)).copied().unwrap_or(0)).sum()
    }
}

/// Scoped acquisition of a resource: increments on creation and
/// guarantees the decrement on all exit paths.
pub struct ResourceGuard {
    monitor: Arc<ResourceMonitor>,
    db: String,
    chunk: i32,
}

impl ResourceGuard {
    pub fn acquire(monitor: Arc<ResourceMonitor>, db: impl Into<String>, chunk: i32) -> Self {
        let db = db.into();
        monitor.increment(&db, chunk);
        ResourceGuard { monitor, db, chunk }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.monitor.decrement(&self.db, self.chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_decrement() {
        let m = ResourceMonitor::new();
        m.increment("LSST", 1);
        m.increment("LSST", 1);
        assert_eq!(m.count(1, "LSST"), 2);
        m.decrement("LSST", 1);
        assert_eq!(m.count(1, "LSST"), 1);
        m.decrement("LSST", 1);
        assert_eq!(m.count(1, "LSST"), 0);
    }

    #[test]
    fn test_count_any_sums_databases() {
        let m = ResourceMonitor::new();
        m.increment("LSST", 1);
        m.increment("SDSS", 1);
        m.increment("SDSS", 2);
        let dbs = vec!["LSST".to_string(), "SDSS".to_string()];
        assert_eq!(m.count_any(1, &dbs), 2);
        assert_eq!(m.count_any(2, &dbs), 1);
        assert_eq!(m.count_any(3, &dbs), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let m = Arc::new(ResourceMonitor::new());
        {
            let _guard = ResourceGuard::acquire(m.clone(), "LSST", 5);
            assert_eq!(m.count(5, "LSST"), 1);
        }
        assert_eq!(m.count(5, "LSST"), 0);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let m = Arc::new(ResourceMonitor::new());
        let m2 = m.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = ResourceGuard::acquire(m2, "LSST", 5);
            panic!("request processing failed");
        });
        assert!(result.is_err());
        assert_eq!(m.count(5, "LSST"), 0);
    }
}
