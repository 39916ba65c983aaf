//! The index build job: per-chunk extraction across the worker fleet.
//!
//! Failure policy is zero tolerance: any failed request or sink write
//! fails the whole job, cancels the remaining in-flight requests (with
//! server-side stops) and rolls back any open SQL transaction. The one
//! exception is a missing transaction partition, which only means the
//! chunk received no contribution in that super-transaction.

use super::request::{IndexRequest, RequestOutcome, WorkerService};
use super::sink::IndexSink;
use crate::db::replicas::ChunkReplicaMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobOutcome {
    Success,
    Failed,
    Cancelled,
}

/// Per-worker, per-chunk error messages of a finished job. Empty on
/// success.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexJobResult {
    pub error: BTreeMap<String, BTreeMap<u32, String>>,
}

#[derive(Debug, Clone)]
pub struct IndexJobParams {
    pub database: String,
    pub director_table: String,
    pub key_column: String,
    /// Restrict extraction to one super-transaction's partition.
    pub transaction_id: Option<u32>,
    /// In-flight request depth per worker. Sized to keep worker
    /// processing saturated while earlier responses stream back;
    /// callers use `8 x workerThreads`.
    pub max_requests_per_worker: usize,
    pub request_timeout: Duration,
}

struct Inflight {
    worker: String,
    chunk: u32,
    handle: JoinHandle<()>,
}

struct Completion {
    id: Uuid,
    completed: super::request::CompletedRequest,
}

pub struct IndexJob<S: WorkerService> {
    params: IndexJobParams,
    service: Arc<S>,
    /// Chunk queue per worker, produced by the planner.
    plan: BTreeMap<String, VecDeque<u32>>,
    inflight: HashMap<Uuid, Inflight>,
    completions: mpsc::UnboundedSender<Completion>,
    result: IndexJobResult,
}

/// Assign every chunk with at least one replica to the worker that
/// currently has the fewest assignments; ties go to the earlier
/// replica. A single greedy pass, slightly biased by chunk order.
fn plan_chunks(replicas: &ChunkReplicaMap) -> BTreeMap<String, VecDeque<u32>> {
    let mut plan: BTreeMap<String, VecDeque<u32>> = BTreeMap::new();
    for (&chunk, workers) in replicas {
        let mut best: Option<&String> = None;
        let mut best_load = usize::MAX;
        for worker in workers {
            let load = plan.get(worker).map(VecDeque::len).unwrap_or(0);
            if load < best_load {
                best = Some(worker);
                best_load = load;
            }
        }
        if let Some(worker) = best {
            plan.entry(worker.clone()).or_default().push_back(chunk);
        }
    }
    plan
}

impl<S: WorkerService> IndexJob<S> {
    /// Run the job over a replica scan to completion or cancellation.
    /// `cancel` flips to true to request a cooperative stop.
    pub async fn run(
        params: IndexJobParams,
        replicas: ChunkReplicaMap,
        service: Arc<S>,
        mut sink: IndexSink,
        cancel: watch::Receiver<bool>,
    ) -> (JobOutcome, IndexJobResult) {
        let plan = plan_chunks(&replicas);
        tracing::info!(
            database = %params.database,
            table = %params.director_table,
            workers = plan.len(),
            chunks = plan.values().map(VecDeque::len).sum::<usize>(),
            "starting index job"
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let mut job = IndexJob {
            params,
            service,
            plan,
            inflight: HashMap::new(),
            completions: tx,
            result: IndexJobResult::default(),
        };
        let outcome = job.drive(&mut sink, rx, cancel).await;
        if outcome != JobOutcome::Success {
            sink.rollback().await;
        }
        tracing::info!(?outcome, "index job finished");
        (outcome, job.result)
    }

    async fn drive(
        &mut self,
        sink: &mut IndexSink,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut cancel: watch::Receiver<bool>,
    ) -> JobOutcome {
        // Pre-launch the initial batch on every worker.
        let workers: Vec<String> = self.plan.keys().cloned().collect();
        for worker in &workers {
            self.launch(worker, self.params.max_requests_per_worker);
        }
        // No workers or no chunks to process.
        if self.inflight.is_empty() {
            return JobOutcome::Success;
        }
        // The cancel branch is disabled once the sender side is gone:
        // nobody can request cancellation any more.
        let mut cancel_alive = true;
        loop {
            if *cancel.borrow() {
                self.cancel_all().await;
                return JobOutcome::Cancelled;
            }
            let completion = tokio::select! {
                changed = cancel.changed(), if cancel_alive => {
                    if changed.is_err() {
                        cancel_alive = false;
                    }
                    continue;
                }
                completion = completions.recv() => match completion {
                    Some(completion) => completion,
                    None => unreachable!("the job holds a completion sender"),
                },
            };
            let Some(done) = self.inflight.remove(&completion.id) else {
                continue;
            };
            let completed = completion.completed;

            if completed.outcome != RequestOutcome::Success && !completed.no_such_partition {
                let message = if completed.error.is_empty() {
                    format!("request finished with {:?}", completed.outcome)
                } else {
                    completed.error.clone()
                };
                tracing::error!(worker = %done.worker, chunk = done.chunk, %message, "index request failed");
                self.result
                    .error
                    .entry(done.worker.clone())
                    .or_default()
                    .insert(done.chunk, message);
                self.cancel_all().await;
                return JobOutcome::Failed;
            }

            // Launch a replacement on the same worker before touching
            // the data, so its in-flight depth stays stable while the
            // payload is being sunk.
            self.launch(&done.worker, 1);

            if completed.no_such_partition {
                tracing::debug!(
                    worker = %done.worker,
                    chunk = done.chunk,
                    "no contribution for the requested partition"
                );
            } else if let Err(e) = sink
                .write(&self.params.database, done.chunk, &completed.data)
                .await
            {
                let message = format!("request data processing failed: {e:#}");
                tracing::error!(worker = %done.worker, chunk = done.chunk, %message);
                self.result
                    .error
                    .entry(done.worker.clone())
                    .or_default()
                    .insert(done.chunk, message);
                self.cancel_all().await;
                return JobOutcome::Failed;
            }

            if self.inflight.is_empty() {
                return JobOutcome::Success;
            }
        }
    }

    /// Issue up to `max` requests from a worker's chunk queue.
    fn launch(&mut self, worker: &str, max: usize) {
        for _ in 0..max {
            let Some(chunk) = self.plan.get_mut(worker).and_then(VecDeque::pop_front) else {
                return;
            };
            let request = IndexRequest::new(
                worker.to_string(),
                self.params.database.clone(),
                self.params.director_table.clone(),
                chunk,
                self.params.transaction_id,
                self.params.key_column.clone(),
                true,
                self.params.request_timeout,
            );
            let id = request.id;
            let service = self.service.clone();
            let completions = self.completions.clone();
            let handle = tokio::spawn(async move {
                let completed = request.execute(service.as_ref()).await;
                // The receiver only closes when the job is done with
                // this request anyway.
                let _ = completions.send(Completion { id, completed });
            });
            self.inflight.insert(id, Inflight { worker: worker.to_string(), chunk, handle });
        }
    }

    /// Abort all in-flight requests and issue server-side stops so the
    /// workers do not keep computing. Clears the remaining plan.
    async fn cancel_all(&mut self) {
        self.plan.clear();
        for (id, inflight) in self.inflight.drain() {
            inflight.handle.abort();
            if let Err(e) = self.service.stop(&inflight.worker, id).await {
                tracing::warn!(worker = %inflight.worker, chunk = inflight.chunk,
                    "failed to stop the request server side: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::request::{IndexDataRequest, WorkerIndexResponse, WorkerIndexStatus};
    use std::sync::Mutex;

    /// Scriptable worker fleet: by default every chunk succeeds with
    /// `rows_per_chunk` TSV rows; individual `(worker, chunk)` pairs
    /// can be overridden.
    struct MockFleet {
        rows_per_chunk: usize,
        overrides: Mutex<HashMap<(String, u32), WorkerIndexStatus>>,
        stops: Mutex<Vec<Uuid>>,
    }

    impl MockFleet {
        fn new(rows_per_chunk: usize) -> Self {
            MockFleet {
                rows_per_chunk,
                overrides: Mutex::new(HashMap::new()),
                stops: Mutex::new(Vec::new()),
            }
        }

        fn set(&self, worker: &str, chunk: u32, status: WorkerIndexStatus) {
            self.overrides.lock().unwrap().insert((worker.to_string(), chunk), status);
        }
    }

    impl WorkerService for MockFleet {
        async fn submit(
            &self,
            worker: &str,
            request: &IndexDataRequest,
        ) -> anyhow::Result<WorkerIndexResponse> {
            let status = self
                .overrides
                .lock()
                .unwrap()
                .get(&(worker.to_string(), request.chunk))
                .copied()
                .unwrap_or(WorkerIndexStatus::Success);
            Ok(match status {
                WorkerIndexStatus::Success => {
                    let mut data = String::new();
                    for row in 0..self.rows_per_chunk {
                        data.push_str(&format!(
                            "{}\t{}\t{}\n",
                            request.chunk as usize * 1000 + row,
                            request.chunk,
                            row
                        ));
                    }
                    WorkerIndexResponse::success(data)
                }
                status => WorkerIndexResponse::failed(status, format!("{status:?}")),
            })
        }

        async fn poll(
            &self,
            _worker: &str,
            _request_id: Uuid,
        ) -> anyhow::Result<WorkerIndexResponse> {
            Ok(WorkerIndexResponse::failed(WorkerIndexStatus::Error, "nothing queued"))
        }

        async fn stop(&self, _worker: &str, request_id: Uuid) -> anyhow::Result<()> {
            self.stops.lock().unwrap().push(request_id);
            Ok(())
        }
    }

    fn params() -> IndexJobParams {
        IndexJobParams {
            database: "LSST".to_string(),
            director_table: "Object".to_string(),
            key_column: "objectId".to_string(),
            transaction_id: None,
            max_requests_per_worker: 8,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// 3 workers, 10 chunks each, single replica per chunk.
    fn three_worker_replicas() -> ChunkReplicaMap {
        let mut replicas = ChunkReplicaMap::new();
        for chunk in 0u32..30 {
            replicas.insert(chunk, vec![format!("worker-{}", chunk / 10)]);
        }
        replicas
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[test]
    fn test_planner_assigns_least_loaded_worker() {
        let mut replicas = ChunkReplicaMap::new();
        for chunk in 0u32..10 {
            replicas
                .insert(chunk, vec!["worker-a".to_string(), "worker-b".to_string()]);
        }
        let plan = plan_chunks(&replicas);
        assert_eq!(plan["worker-a"].len(), 5);
        assert_eq!(plan["worker-b"].len(), 5);
    }

    #[test]
    fn test_planner_skips_unreplicated_chunks() {
        let mut replicas = ChunkReplicaMap::new();
        replicas.insert(1, vec!["worker-a".to_string()]);
        replicas.insert(2, vec![]);
        let plan = plan_chunks(&replicas);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan["worker-a"], VecDeque::from(vec![1]));
    }

    #[tokio::test]
    async fn test_folder_destination_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = Arc::new(MockFleet::new(100));
        let sink = IndexSink::Folder { dir: dir.path().to_path_buf() };
        let (outcome, result) =
            IndexJob::run(params(), three_worker_replicas(), fleet, sink, no_cancel()).await;
        assert_eq!(outcome, JobOutcome::Success);
        assert!(result.error.is_empty());

        let mut files = 0;
        let mut lines = 0;
        for entry in std::fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(name.starts_with("LSST_") && name.ends_with(".tsv"));
            files += 1;
            lines += std::fs::read_to_string(entry.path()).unwrap().lines().count();
        }
        assert_eq!(files, 30);
        assert_eq!(lines, 3000);
    }

    #[tokio::test]
    async fn test_missing_partitions_are_empty_contributions() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = Arc::new(MockFleet::new(10));
        // Half of worker-0's chunks have no partition.
        for chunk in [0u32, 2, 4, 6, 8] {
            fleet.set("worker-0", chunk, WorkerIndexStatus::NoSuchPartition);
        }
        let sink = IndexSink::Folder { dir: dir.path().to_path_buf() };
        let (outcome, result) =
            IndexJob::run(params(), three_worker_replicas(), fleet, sink, no_cancel()).await;
        assert_eq!(outcome, JobOutcome::Success);
        assert!(result.error.is_empty());
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 25, "only contributing chunks produce files");
    }

    #[tokio::test]
    async fn test_server_bad_fails_the_job() {
        let fleet = Arc::new(MockFleet::new(10));
        fleet.set("worker-1", 13, WorkerIndexStatus::Bad);
        let (outcome, result) = IndexJob::run(
            params(),
            three_worker_replicas(),
            fleet.clone(),
            IndexSink::Discard,
            no_cancel(),
        )
        .await;
        assert_eq!(outcome, JobOutcome::Failed);
        assert_eq!(result.error["worker-1"][&13], "Bad");
    }

    #[tokio::test]
    async fn test_empty_replica_scan_succeeds_immediately() {
        let fleet = Arc::new(MockFleet::new(10));
        let (outcome, result) = IndexJob::run(
            params(),
            ChunkReplicaMap::new(),
            fleet,
            IndexSink::Discard,
            no_cancel(),
        )
        .await;
        assert_eq!(outcome, JobOutcome::Success);
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_outstanding_requests() {
        let fleet = Arc::new(MockFleet::new(10));
        let (cancel_tx, cancel_rx) = watch::channel(true);
        let (outcome, _result) = IndexJob::run(
            params(),
            three_worker_replicas(),
            fleet.clone(),
            IndexSink::Discard,
            cancel_rx,
        )
        .await;
        drop(cancel_tx);
        assert_eq!(outcome, JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_inflight_depth_bounded_per_worker() {
        // With a depth of 2 and instant completions, the job still
        // drains all 30 chunks.
        let fleet = Arc::new(MockFleet::new(1));
        let mut p = params();
        p.max_requests_per_worker = 2;
        let dir = tempfile::tempdir().unwrap();
        let sink = IndexSink::Folder { dir: dir.path().to_path_buf() };
        let (outcome, _) =
            IndexJob::run(p, three_worker_replicas(), fleet, sink, no_cancel()).await;
        assert_eq!(outcome, JobOutcome::Success);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 30);
    }
}
