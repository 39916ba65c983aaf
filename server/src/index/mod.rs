//! The director-index build subsystem.
//!
//! The controller side of rebuilding the "secondary index": the keyed
//! `(primaryKey -> chunkId, subChunkId)` table the coordinator uses to
//! route point queries. The job scans replicas, plans per-worker chunk
//! queues, issues bounded batches of extraction requests, and sinks
//! the streamed results.

pub mod job;
pub mod request;
pub mod sink;
