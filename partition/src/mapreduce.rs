//! Phase-alternating map-reduce engine for bulk partitioning.
//!
//! A job runs `num_workers` OS threads (the caller participates as one)
//! over shared state guarded by a single mutex with two condition
//! variables. The threads alternate between two phases:
//!
//! - **Map**: each thread pops the fullest silo from the shared pool,
//!   releases the lock, reads one input block and maps it into the
//!   silo. A silo whose memory use passes `pool_size / num_workers` is
//!   sorted and moved to the sorted queue; otherwise it returns to the
//!   pool. When the input runs dry every remaining silo drains through
//!   the same path, and the threads barrier on the reducer count.
//! - **Reduce**: the sorted silos are frozen and shared; each thread
//!   merge-walks a heap of sorted record ranges and hands each maximal
//!   run of equal-keyed records to its worker, but only when the key
//!   hashes to the thread's rank. `finish` is called on every worker at
//!   the end of each reduce phase.
//!
//! If input remains, the last thread to re-enter the map barrier
//! reclaims the silos, clears them and the cycle repeats; otherwise
//! worker outputs are merged into the job output.
//!
//! Guarantees relied on by workers: a worker of rank `r` sees all
//! records whose key hashes to `r` modulo the worker count and no
//! others; within one reduce phase keys arrive in ascending order; the
//! same key may reappear across phases, so reducers accumulate rather
//! than close per call.
//!
//! Any worker error marks the job failed, wakes every waiting thread,
//! and is returned from `run` after the pool drains.

use crate::input::InputLines;
use crate::silo::{Record, Silo, SiloKey};
use anyhow::{anyhow, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub const MIB: usize = 1024 * 1024;

/// Merging of per-worker outputs into a job output.
pub trait Merge {
    fn merge(&mut self, other: Self);
}

/// A map-reduce worker. One instance is constructed per thread; the
/// engine guarantees single-threaded use of each instance and that no
/// thread maps while another reduces.
pub trait Worker: Send {
    type Key: SiloKey;
    type Output: Merge + Send;

    /// Transform one block of input lines into keyed records.
    fn map(&mut self, block: &[u8], silo: &mut Silo<Self::Key>) -> Result<()>;

    /// Consume a run of equal-keyed records. Bytes are resolved against
    /// the silo holding the run.
    fn reduce(&mut self, silo: &Silo<Self::Key>, records: &[Record<Self::Key>]) -> Result<()>;

    /// Flush any state retained by `reduce`. Called on every worker at
    /// the end of every reduce phase.
    fn finish(&mut self) -> Result<()>;

    /// The worker's contribution to the job output, if any.
    fn into_output(self) -> Option<Self::Output>;
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// IO block size in MiB, 1 to 1024.
    pub block_size_mib: usize,
    /// Worker thread count, at least 1.
    pub num_workers: usize,
    /// Memory pool soft limit in MiB. Data accumulates in silos up to
    /// roughly this total before each reduction pass.
    pub pool_size_mib: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions { block_size_mib: 4, num_workers: 1, pool_size_mib: 1024 }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=1024).contains(&self.block_size_mib) {
            return Err(anyhow!("the block size must be between 1 and 1024 MiB"));
        }
        if self.num_workers < 1 {
            return Err(anyhow!("the number of worker threads must be at least 1"));
        }
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        self.block_size_mib * MIB
    }
}

struct State<K: SiloKey> {
    /// Silo pool; the fullest silo is popped first, which minimizes the
    /// number of spill events at the cost of a slightly larger tail
    /// sort.
    silos: Vec<Silo<K>>,
    /// Silos sorted and queued for the next reduce phase.
    sorted: Vec<Silo<K>>,
    /// The sorted silos of the current reduce phase, shared read-only
    /// across threads for the duration of the phase.
    frozen: Option<Arc<Vec<Silo<K>>>>,
    input_exhausted: bool,
    num_mappers: usize,
    num_reducers: usize,
    failed: Option<String>,
}

struct Shared<K: SiloKey> {
    state: Mutex<State<K>>,
    map_cond: Condvar,
    reduce_cond: Condvar,
}

impl<K: SiloKey> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().expect("engine state lock poisoned")
    }

    fn fail(&self, message: String) {
        let mut state = self.lock();
        if state.failed.is_none() {
            state.failed = Some(message);
            drop(state);
            self.map_cond.notify_all();
            self.reduce_cond.notify_all();
        }
    }
}

/// A sorted range of records within one frozen silo, ordered by its
/// minimum record so a heap of ranges pops the globally smallest key.
struct RangeHead<'a, K: SiloKey> {
    silo: &'a Silo<K>,
    records: &'a [Record<K>],
    pos: usize,
}

impl<K: SiloKey> RangeHead<'_, K> {
    fn key(&self) -> &K {
        &self.records[self.pos].key
    }
}

impl<K: SiloKey> PartialEq for RangeHead<'_, K> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<K: SiloKey> Eq for RangeHead<'_, K> {}

impl<K: SiloKey> Ord for RangeHead<'_, K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the std max-heap yields the smallest key first.
        other.key().cmp(self.key())
    }
}

impl<K: SiloKey> PartialOrd for RangeHead<'_, K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Runs map-reduce jobs over a pool of worker threads.
pub struct Job {
    num_workers: usize,
    threshold: usize,
}

impl Job {
    pub fn new(options: &EngineOptions) -> Result<Self> {
        options.validate()?;
        Ok(Job {
            num_workers: options.num_workers,
            threshold: options.pool_size_mib * MIB / options.num_workers,
        })
    }

    /// Run a job to completion. `factory` constructs one worker per
    /// thread. Returns the merged worker outputs, or the first worker
    /// error.
    pub fn run<W, F>(&self, input: &InputLines, factory: F) -> Result<Option<W::Output>>
    where
        W: Worker,
        F: Fn() -> Result<W> + Sync,
    {
        let shared: Shared<W::Key> = Shared {
            state: Mutex::new(State {
                silos: (0..self.num_workers).map(|_| Silo::new()).collect(),
                sorted: Vec::with_capacity(self.num_workers),
                frozen: None,
                input_exhausted: false,
                num_mappers: 0,
                num_reducers: 0,
                failed: None,
            }),
            map_cond: Condvar::new(),
            reduce_cond: Condvar::new(),
        };
        let output: Mutex<Option<W::Output>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..self.num_workers - 1 {
                scope.spawn(|| self.work_entry::<W, F>(&shared, input, &factory, &output));
            }
            // The caller participates in job execution, avoiding thread
            // overhead in the single-threaded case.
            self.work_entry::<W, F>(&shared, input, &factory, &output);
        });

        let state = shared.state.into_inner().expect("engine state lock poisoned");
        if let Some(message) = state.failed {
            return Err(anyhow!(message));
        }
        Ok(output.into_inner().expect("output lock poisoned"))
    }

    fn work_entry<W, F>(
        &self,
        shared: &Shared<W::Key>,
        input: &InputLines,
        factory: &F,
        output: &Mutex<Option<W::Output>>,
    ) where
        W: Worker,
        F: Fn() -> Result<W> + Sync,
    {
        let worker = match factory() {
            Ok(w) => w,
            Err(e) => {
                shared.fail(e.to_string());
                return;
            }
        };
        if let Err(e) = self.work(shared, input, worker, output) {
            shared.fail(e.to_string());
        }
    }

    /// The per-thread scheduling loop. Returns Ok both on normal
    /// completion and when abandoning a failed job; errors raised here
    /// are this thread's own.
    fn work<W>(
        &self,
        shared: &Shared<W::Key>,
        input: &InputLines,
        mut worker: W,
        output: &Mutex<Option<W::Output>>,
    ) -> Result<()>
    where
        W: Worker,
    {
        let n = self.num_workers;
        let mut buf: Vec<u8> = Vec::with_capacity(input.min_buffer_capacity());

        let mut state = shared.lock();
        let rank = state.num_mappers;
        state.num_mappers += 1;

        loop {
            // Map phase.
            while !state.silos.is_empty() {
                if state.failed.is_some() {
                    return Ok(());
                }
                let mut silo = pop_fullest(&mut state.silos);
                drop(state);
                if !input.read(&mut buf)? {
                    silo.sort();
                    state = shared.lock();
                    state.input_exhausted = true;
                    state.sorted.push(silo);
                    continue;
                }
                worker.map(&buf, &mut silo)?;
                if silo.bytes_used() > self.threshold {
                    silo.sort();
                    state = shared.lock();
                    state.sorted.push(silo);
                    continue;
                }
                state = shared.lock();
                state.silos.push(silo);
            }
            // Wait until all mappers have finished, then freeze the
            // sorted silos for shared read access during reduction.
            if state.failed.is_some() {
                return Ok(());
            }
            state.num_reducers += 1;
            if state.num_reducers == n {
                debug_assert_eq!(state.sorted.len(), n);
                let sorted = std::mem::take(&mut state.sorted);
                state.frozen = Some(Arc::new(sorted));
                state.num_mappers = 0;
            } else {
                while state.num_reducers != n {
                    state = shared.reduce_cond.wait(state).expect("engine state lock poisoned");
                    if state.failed.is_some() {
                        return Ok(());
                    }
                }
            }
            shared.reduce_cond.notify_one();
            let frozen = state.frozen.clone().expect("sorted silos frozen at phase entry");
            drop(state);

            // Reduce phase.
            merge_reduce(&frozen, rank as u32, n as u32, &mut worker)?;
            worker.finish()?;
            drop(frozen);

            state = shared.lock();
            if state.failed.is_some() {
                return Ok(());
            }
            // If no further input is available, store this worker's
            // output and exit.
            if state.input_exhausted {
                drop(state);
                if let Some(out) = worker.into_output() {
                    let mut merged = output.lock().expect("output lock poisoned");
                    match merged.as_mut() {
                        Some(acc) => acc.merge(out),
                        None => *merged = Some(out),
                    }
                }
                return Ok(());
            }
            // Otherwise wait for all reducers, then start another map
            // phase. The last thread to arrive reclaims the silos.
            state.num_mappers += 1;
            if state.num_mappers == n {
                let frozen = state.frozen.take().expect("sorted silos frozen at phase exit");
                let mut silos =
                    Arc::try_unwrap(frozen).map_err(|_| anyhow!("sorted silos still shared"))?;
                for silo in &mut silos {
                    silo.clear();
                }
                state.silos = silos;
                state.num_reducers = 0;
            } else {
                while state.num_mappers != n {
                    state = shared.map_cond.wait(state).expect("engine state lock poisoned");
                    if state.failed.is_some() {
                        return Ok(());
                    }
                }
            }
            shared.map_cond.notify_one();
        }
    }
}

/// Pop the silo using the most memory. The pool size equals the worker
/// count, so a linear scan is cheaper than maintaining heap order.
fn pop_fullest<K: SiloKey>(silos: &mut Vec<Silo<K>>) -> Silo<K> {
    let mut fullest = 0;
    for (i, silo) in silos.iter().enumerate() {
        if silo.bytes_used() > silos[fullest].bytes_used() {
            fullest = i;
        }
    }
    silos.swap_remove(fullest)
}

/// Merge-sort walk over the sorted silos, delivering each maximal run
/// of equal-keyed records that hashes to `rank` to the worker.
fn merge_reduce<W: Worker>(
    silos: &[Silo<W::Key>],
    rank: u32,
    num_workers: u32,
    worker: &mut W,
) -> Result<()> {
    let mut heap: BinaryHeap<RangeHead<'_, W::Key>> = silos
        .iter()
        .filter(|s| !s.is_empty())
        .map(|silo| RangeHead { silo, records: silo.records(), pos: 0 })
        .collect();
    while let Some(mut head) = heap.pop() {
        let start = head.pos;
        let key = head.records[start].key.clone();
        let run = head.records[start..].partition_point(|r| r.key.cmp(&key) != Ordering::Greater);
        let end = start + run;
        if key.hash32() % num_workers == rank {
            worker.reduce(head.silo, &head.records[start..end])?;
        }
        head.pos = end;
        if head.pos < head.records.len() {
            heap.push(head);
        }
    }
    Ok(())
}
