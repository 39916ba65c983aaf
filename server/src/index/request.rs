//! A single per-chunk index data extraction request.
//!
//! The request is issued to the worker hosting the chunk, and with
//! `keep_tracking` it follows up on queued or still-running work with
//! status polls on an interval-doubling timer, up to a cap. The whole
//! exchange is bounded by the request timeout.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Initial status poll delay; doubles after each poll.
const POLL_INITIAL: Duration = Duration::from_secs(1);
/// Poll delay cap.
const POLL_MAX: Duration = Duration::from_secs(60);

/// Worker-side status of an extraction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerIndexStatus {
    Success,
    /// The chunk table has no partition for the requested transaction.
    NoSuchPartition,
    Queued,
    InProgress,
    IsCancelling,
    Bad,
    Error,
    Cancelled,
}

/// Worker-reported timing counters; when present in a status response
/// they override the locally measured ones.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RequestPerformance {
    pub queued_ms: u64,
    pub started_ms: u64,
    pub finished_ms: u64,
}

/// A worker's reply to a submit or status poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIndexResponse {
    pub status: WorkerIndexStatus,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_performance: Option<RequestPerformance>,
}

impl WorkerIndexResponse {
    pub fn success(data: String) -> Self {
        WorkerIndexResponse {
            status: WorkerIndexStatus::Success,
            data,
            error: String::new(),
            target_performance: None,
        }
    }

    pub fn failed(status: WorkerIndexStatus, error: impl Into<String>) -> Self {
        WorkerIndexResponse {
            status,
            data: String::new(),
            error: error.into(),
            target_performance: None,
        }
    }
}

/// The submit body sent to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDataRequest {
    pub request_id: Uuid,
    pub database: String,
    pub director_table: String,
    pub chunk: u32,
    /// When set, extraction is restricted to this super-transaction's
    /// partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<u32>,
    /// The director table's primary key column.
    pub key_column: String,
}

/// Terminal classification of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestOutcome {
    Success,
    ServerQueued,
    ServerInProgress,
    ServerIsCancelling,
    ServerBad,
    ServerError,
    ServerCancelled,
    ClientError,
}

/// A finished request as seen by the job.
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub outcome: RequestOutcome,
    /// A failed request whose only problem is a missing transaction
    /// partition; treated as an empty contribution, not an error.
    pub no_such_partition: bool,
    pub data: String,
    pub error: String,
    pub performance: RequestPerformance,
}

/// The transport seam to workers. Production code uses
/// [`HttpWorkerService`]; the job tests use an in-memory mock.
pub trait WorkerService: Send + Sync + 'static {
    fn submit(
        &self,
        worker: &str,
        request: &IndexDataRequest,
    ) -> impl std::future::Future<Output = anyhow::Result<WorkerIndexResponse>> + Send;

    fn poll(
        &self,
        worker: &str,
        request_id: Uuid,
    ) -> impl std::future::Future<Output = anyhow::Result<WorkerIndexResponse>> + Send;

    /// Server-side stop, so a cancelled request does not keep a worker
    /// computing.
    fn stop(
        &self,
        worker: &str,
        request_id: Uuid,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub id: Uuid,
    pub worker: String,
    pub body: IndexDataRequest,
    pub keep_tracking: bool,
    pub timeout: Duration,
}

impl IndexRequest {
    pub fn new(
        worker: String,
        database: String,
        director_table: String,
        chunk: u32,
        transaction_id: Option<u32>,
        key_column: String,
        keep_tracking: bool,
        timeout: Duration,
    ) -> Self {
        let id = Uuid::new_v4();
        IndexRequest {
            id,
            worker,
            body: IndexDataRequest {
                request_id: id,
                database,
                director_table,
                chunk,
                transaction_id,
                key_column,
            },
            keep_tracking,
            timeout,
        }
    }

    pub fn chunk(&self) -> u32 {
        self.body.chunk
    }

    /// Drive the request to a terminal state.
    pub async fn execute<S: WorkerService>(&self, service: &S) -> CompletedRequest {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(self.timeout, self.drive(service)).await;
        match result {
            Ok(completed) => completed,
            Err(_) => {
                tracing::warn!(worker = %self.worker, chunk = self.chunk(), "index request timed out");
                CompletedRequest {
                    outcome: RequestOutcome::ClientError,
                    no_such_partition: false,
                    data: String::new(),
                    error: format!(
                        "index request to worker '{}' timed out after {:?}",
                        self.worker,
                        started.elapsed()
                    ),
                    performance: RequestPerformance::default(),
                }
            }
        }
    }

    async fn drive<S: WorkerService>(&self, service: &S) -> CompletedRequest {
        tracing::debug!(worker = %self.worker, chunk = self.chunk(), id = %self.id, "submitting index request");
        let queued = std::time::Instant::now();
        let mut response = match service.submit(&self.worker, &self.body).await {
            Ok(response) => response,
            Err(e) => return self.client_error(e),
        };
        let mut delay = POLL_INITIAL;
        while self.keep_tracking && Self::pending(response.status) {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
            tracing::debug!(worker = %self.worker, id = %self.id, "polling index request status");
            response = match service.poll(&self.worker, self.id).await {
                Ok(response) => response,
                Err(e) => return self.client_error(e),
            };
        }
        // Local timing; overridden by the worker's counters when the
        // status response carries them.
        let performance = response.target_performance.unwrap_or(RequestPerformance {
            queued_ms: 0,
            started_ms: 0,
            finished_ms: queued.elapsed().as_millis() as u64,
        });
        let outcome = match response.status {
            WorkerIndexStatus::Success => RequestOutcome::Success,
            WorkerIndexStatus::NoSuchPartition => RequestOutcome::ServerError,
            WorkerIndexStatus::Queued => RequestOutcome::ServerQueued,
            WorkerIndexStatus::InProgress => RequestOutcome::ServerInProgress,
            WorkerIndexStatus::IsCancelling => RequestOutcome::ServerIsCancelling,
            WorkerIndexStatus::Bad => RequestOutcome::ServerBad,
            WorkerIndexStatus::Error => RequestOutcome::ServerError,
            WorkerIndexStatus::Cancelled => RequestOutcome::ServerCancelled,
        };
        CompletedRequest {
            outcome,
            no_such_partition: response.status == WorkerIndexStatus::NoSuchPartition,
            data: response.data,
            error: response.error,
            performance,
        }
    }

    fn pending(status: WorkerIndexStatus) -> bool {
        matches!(
            status,
            WorkerIndexStatus::Queued
                | WorkerIndexStatus::InProgress
                | WorkerIndexStatus::IsCancelling
        )
    }

    fn client_error(&self, e: anyhow::Error) -> CompletedRequest {
        tracing::warn!(worker = %self.worker, chunk = self.chunk(), "index request failed: {e:#}");
        CompletedRequest {
            outcome: RequestOutcome::ClientError,
            no_such_partition: false,
            data: String::new(),
            error: e.to_string(),
            performance: RequestPerformance::default(),
        }
    }
}

/// HTTP transport to the worker REST surface.
pub struct HttpWorkerService {
    client: reqwest::Client,
    workers: std::collections::BTreeMap<String, String>,
}

impl HttpWorkerService {
    pub fn new(workers: std::collections::BTreeMap<String, String>) -> Self {
        HttpWorkerService { client: reqwest::Client::new(), workers }
    }

    fn base_url(&self, worker: &str) -> anyhow::Result<&str> {
        self.workers
            .get(worker)
            .map(String::as_str)
            .ok_or_else(|| anyhow::anyhow!("unknown worker '{worker}'"))
    }
}

impl WorkerService for HttpWorkerService {
    async fn submit(
        &self,
        worker: &str,
        request: &IndexDataRequest,
    ) -> anyhow::Result<WorkerIndexResponse> {
        let url = format!("{}/worker/index-data", self.base_url(worker)?);
        let response = self.client.post(url).json(request).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn poll(&self, worker: &str, request_id: Uuid) -> anyhow::Result<WorkerIndexResponse> {
        let url = format!("{}/worker/index-requests/{request_id}", self.base_url(worker)?);
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn stop(&self, worker: &str, request_id: Uuid) -> anyhow::Result<()> {
        let url = format!("{}/worker/index-requests/{request_id}", self.base_url(worker)?);
        self.client.delete(url).send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedService {
        submit_reply: WorkerIndexResponse,
        poll_replies: Mutex<Vec<WorkerIndexResponse>>,
        polls: AtomicUsize,
    }

    impl WorkerService for ScriptedService {
        async fn submit(
            &self,
            _worker: &str,
            _request: &IndexDataRequest,
        ) -> anyhow::Result<WorkerIndexResponse> {
            Ok(self.submit_reply.clone())
        }

        async fn poll(
            &self,
            _worker: &str,
            _request_id: Uuid,
        ) -> anyhow::Result<WorkerIndexResponse> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.poll_replies.lock().unwrap().remove(0))
        }

        async fn stop(&self, _worker: &str, _request_id: Uuid) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn request(keep_tracking: bool) -> IndexRequest {
        IndexRequest::new(
            "worker-a".into(),
            "LSST".into(),
            "Object".into(),
            12,
            None,
            "objectId".into(),
            keep_tracking,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_immediate_success() {
        let service = ScriptedService {
            submit_reply: WorkerIndexResponse::success("1\t12\t3\n".into()),
            poll_replies: Mutex::new(vec![]),
            polls: AtomicUsize::new(0),
        };
        let completed = request(true).execute(&service).await;
        assert_eq!(completed.outcome, RequestOutcome::Success);
        assert_eq!(completed.data, "1\t12\t3\n");
        assert_eq!(service.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_polls_until_terminal() {
        let service = ScriptedService {
            submit_reply: WorkerIndexResponse::failed(WorkerIndexStatus::Queued, ""),
            poll_replies: Mutex::new(vec![
                WorkerIndexResponse::failed(WorkerIndexStatus::InProgress, ""),
                WorkerIndexResponse::success("data".into()),
            ]),
            polls: AtomicUsize::new(0),
        };
        let completed = request(true).execute(&service).await;
        assert_eq!(completed.outcome, RequestOutcome::Success);
        assert_eq!(service.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_tracking_returns_server_state() {
        let service = ScriptedService {
            submit_reply: WorkerIndexResponse::failed(WorkerIndexStatus::Queued, ""),
            poll_replies: Mutex::new(vec![]),
            polls: AtomicUsize::new(0),
        };
        let completed = request(false).execute(&service).await;
        assert_eq!(completed.outcome, RequestOutcome::ServerQueued);
    }

    #[tokio::test]
    async fn test_no_such_partition_flagged() {
        let service = ScriptedService {
            submit_reply: WorkerIndexResponse::failed(WorkerIndexStatus::NoSuchPartition, ""),
            poll_replies: Mutex::new(vec![]),
            polls: AtomicUsize::new(0),
        };
        let completed = request(true).execute(&service).await;
        assert_ne!(completed.outcome, RequestOutcome::Success);
        assert!(completed.no_such_partition);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_client_error() {
        struct NeverDone;
        impl WorkerService for NeverDone {
            async fn submit(
                &self,
                _worker: &str,
                _request: &IndexDataRequest,
            ) -> anyhow::Result<WorkerIndexResponse> {
                Ok(WorkerIndexResponse::failed(WorkerIndexStatus::Queued, ""))
            }
            async fn poll(
                &self,
                _worker: &str,
                _request_id: Uuid,
            ) -> anyhow::Result<WorkerIndexResponse> {
                Ok(WorkerIndexResponse::failed(WorkerIndexStatus::Queued, ""))
            }
            async fn stop(&self, _worker: &str, _request_id: Uuid) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let mut req = request(true);
        req.timeout = Duration::from_secs(5);
        let completed = req.execute(&NeverDone).await;
        assert_eq!(completed.outcome, RequestOutcome::ClientError);
        assert!(completed.error.contains("timed out"));
    }

    #[test]
    fn test_performance_override() {
        let response = WorkerIndexResponse {
            status: WorkerIndexStatus::Success,
            data: String::new(),
            error: String::new(),
            target_performance: Some(RequestPerformance {
                queued_ms: 5,
                started_ms: 6,
                finished_ms: 7,
            }),
        };
        let perf = response.target_performance.unwrap();
        assert_eq!((perf.queued_ms, perf.started_ms, perf.finished_ms), (5, 6, 7));
    }
}
