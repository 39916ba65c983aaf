//! Record counts for the chunks and sub-chunks of a partitioned data set.
//!
//! A chunk index has a binary file format with the following property:
//! the concatenation of two index files derived from identical
//! partitioning parameters is a valid index file equivalent to the index
//! of the union of the original inputs. This lets partitioning processes
//! emit per-run fragments in parallel with no coordination; a driver
//! merges them by reading them all, or by plain byte concatenation.

use crate::chunker::ChunkLocation;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

/// On-disk record size: composite id, record count, overlap record
/// count, each a little-endian u64.
pub const ENTRY_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum IndexFileError {
    #[error("invalid chunk index file {path}: size {size} is not a multiple of {ENTRY_SIZE}")]
    BadSize { path: String, size: u64 },
    #[error("chunk index I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Record counts for one chunk or sub-chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Entry {
    pub num_records: u64,
    pub num_overlap_records: u64,
}

impl std::ops::AddAssign for Entry {
    fn add_assign(&mut self, e: Entry) {
        self.num_records += e.num_records;
        self.num_overlap_records += e.num_overlap_records;
    }
}

/// Summary statistics over a population of record counts.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub nrec: u64,
    pub n: u64,
    pub min: u64,
    pub max: u64,
    pub quartile: [u64; 3],
    pub mean: f64,
    pub sigma: f64,
    pub skewness: f64,
    pub kurtosis: f64,
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            nrec: 0,
            n: 0,
            min: 0,
            max: 0,
            quartile: [0; 3],
            mean: 0.0,
            sigma: f64::NAN,
            skewness: f64::NAN,
            kurtosis: f64::NAN,
        }
    }
}

// Rank of the p-th percentile: floor(p*n + 0.5), clamped. This is the
// historical definition used by the index file consumers; keep it so
// emitted statistics stay bit-identical.
fn percentile(p: f64, sorted: &[u64]) -> u64 {
    let i = ((p * sorted.len() as f64 + 0.5).floor() as usize).min(sorted.len() - 1);
    sorted[i]
}

impl Stats {
    /// Compute statistics from a population of counts. Sorts `counts` in
    /// place but does not otherwise modify it. An empty population
    /// yields zero counts and NaN moments.
    pub fn compute_from(counts: &mut Vec<u64>) -> Stats {
        if counts.is_empty() {
            return Stats::default();
        }
        let mut nrec = 0u64;
        let mut min = u64::MAX;
        let mut max = 0u64;
        for &c in counts.iter() {
            nrec += c;
            min = min.min(c);
            max = max.max(c);
        }
        counts.sort_unstable();
        let n = counts.len() as u64;
        let quartile = [
            percentile(0.25, counts),
            percentile(0.5, counts),
            percentile(0.75, counts),
        ];
        let mean = nrec as f64 / n as f64;
        let (mut m2, mut m3, mut m4) = (0.0f64, 0.0f64, 0.0f64);
        for &c in counts.iter() {
            let d = c as f64 - mean;
            let d2 = d * d;
            m2 += d2;
            m3 += d2 * d;
            m4 += d2 * d2;
        }
        m2 /= n as f64;
        m3 /= n as f64;
        m4 /= n as f64;
        Stats {
            nrec,
            n,
            min,
            max,
            quartile,
            mean,
            sigma: m2.sqrt(),
            skewness: m3 / m2.powf(1.5),
            kurtosis: m4 / (m2 * m2) - 3.0,
        }
    }
}

/// Which of the four cached statistic populations to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Population {
    Chunks,
    OverlapChunks,
    SubChunks,
    OverlapSubChunks,
}

/// Tracks how many records and overlap records are in each chunk and
/// sub-chunk of a partitioned input data set.
#[derive(Debug, Default, Clone)]
pub struct ChunkIndex {
    chunks: HashMap<i32, Entry>,
    sub_chunks: HashMap<i64, Entry>,
    modified: bool,
    chunk_stats: Stats,
    overlap_chunk_stats: Stats,
    sub_chunk_stats: Stats,
    overlap_sub_chunk_stats: Stats,
}

const EMPTY: Entry = Entry { num_records: 0, num_overlap_records: 0 };

impl ChunkIndex {
    pub fn new() -> Self {
        ChunkIndex::default()
    }

    /// Read a chunk index from a file.
    pub fn from_path(path: &Path) -> Result<Self, IndexFileError> {
        let mut index = ChunkIndex::new();
        index.read(path)?;
        Ok(index)
    }

    /// Read and merge a list of chunk index files.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self, IndexFileError> {
        let mut index = ChunkIndex::new();
        for p in paths {
            index.read(p.as_ref())?;
        }
        Ok(index)
    }

    /// The number of non-empty chunks in the index.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Record counts for the given chunk; a zero entry if absent.
    pub fn chunk(&self, chunk_id: i32) -> &Entry {
        self.chunks.get(&chunk_id).unwrap_or(&EMPTY)
    }

    /// Record counts for the given sub-chunk; a zero entry if absent.
    pub fn sub_chunk(&self, chunk_id: i32, sub_chunk_id: i32) -> &Entry {
        let key = ((chunk_id as i64) << 32) + sub_chunk_id as i64;
        self.sub_chunks.get(&key).unwrap_or(&EMPTY)
    }

    /// The number of records with the given location.
    pub fn count(&self, loc: &ChunkLocation) -> u64 {
        let e = self.sub_chunk(loc.chunk_id, loc.sub_chunk_id);
        if loc.overlap {
            e.num_overlap_records
        } else {
            e.num_records
        }
    }

    /// Add `n` records at the given location. A no-op when `n` is zero.
    pub fn add(&mut self, loc: &ChunkLocation, n: u64) {
        if n == 0 {
            return;
        }
        let c = self.chunks.entry(loc.chunk_id).or_default();
        if loc.overlap {
            c.num_overlap_records += n;
        } else {
            c.num_records += n;
        }
        let sc = self.sub_chunks.entry(loc.composite()).or_default();
        if loc.overlap {
            sc.num_overlap_records += n;
        } else {
            sc.num_records += n;
        }
        self.modified = true;
    }

    /// Merge the entries of another index into this one.
    pub fn merge(&mut self, other: &ChunkIndex) {
        if std::ptr::eq(self, other) || other.is_empty() {
            return;
        }
        for (&id, e) in &other.chunks {
            *self.chunks.entry(id).or_default() += *e;
        }
        for (&id, e) in &other.sub_chunks {
            *self.sub_chunks.entry(id).or_default() += *e;
        }
        self.modified = true;
    }

    /// Read a chunk index file, accumulating its entries into this
    /// index. Fails unless the file size is a multiple of the entry
    /// size.
    pub fn read(&mut self, path: &Path) -> Result<(), IndexFileError> {
        let io_err = |source| IndexFileError::Io { path: path.display().to_string(), source };
        let mut f = std::fs::File::open(path).map_err(io_err)?;
        let size = f.metadata().map_err(io_err)?.len();
        if size % ENTRY_SIZE as u64 != 0 {
            return Err(IndexFileError::BadSize { path: path.display().to_string(), size });
        }
        if size == 0 {
            return Ok(());
        }
        let mut data = Vec::with_capacity(size as usize);
        f.read_to_end(&mut data).map_err(io_err)?;
        for rec in data.chunks_exact(ENTRY_SIZE) {
            let id = u64::from_le_bytes(rec[0..8].try_into().unwrap()) as i64;
            let entry = Entry {
                num_records: u64::from_le_bytes(rec[8..16].try_into().unwrap()),
                num_overlap_records: u64::from_le_bytes(rec[16..24].try_into().unwrap()),
            };
            *self.chunks.entry((id >> 32) as i32).or_default() += entry;
            *self.sub_chunks.entry(id).or_default() += entry;
        }
        self.modified = true;
        Ok(())
    }

    /// Write or append the index to a binary file. With `truncate`
    /// false, multiple processes may grow one file incrementally as long
    /// as they write disjoint sub-chunk populations.
    pub fn write(&self, path: &Path, truncate: bool) -> Result<(), IndexFileError> {
        let io_err = |source| IndexFileError::Io { path: path.display().to_string(), source };
        let mut buf = Vec::with_capacity(self.sub_chunks.len() * ENTRY_SIZE);
        for (&id, e) in &self.sub_chunks {
            buf.extend_from_slice(&(id as u64).to_le_bytes());
            buf.extend_from_slice(&e.num_records.to_le_bytes());
            buf.extend_from_slice(&e.num_overlap_records.to_le_bytes());
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(!truncate)
            .write(true)
            .truncate(truncate)
            .open(path)
            .map_err(io_err)?;
        f.write_all(&buf).map_err(io_err)?;
        Ok(())
    }

    /// Summary statistics for one of the four populations, recomputing
    /// the cache only when the index changed since the last call.
    pub fn stats(&mut self, population: Population) -> &Stats {
        if self.modified {
            self.compute_stats();
        }
        match population {
            Population::Chunks => &self.chunk_stats,
            Population::OverlapChunks => &self.overlap_chunk_stats,
            Population::SubChunks => &self.sub_chunk_stats,
            Population::OverlapSubChunks => &self.overlap_sub_chunk_stats,
        }
    }

    /// A JSON summary of the index. With `verbosity` 0 the per-chunk
    /// record counts are included; above 0 the per-sub-chunk counts as
    /// well (the output can be voluminous); below 0, statistics only.
    pub fn summary(&mut self, verbosity: i32) -> serde_json::Value {
        if self.modified {
            self.compute_stats();
        }
        let mut doc = serde_json::json!({
            "chunkStats": &self.chunk_stats,
            "overlapChunkStats": &self.overlap_chunk_stats,
            "subChunkStats": &self.sub_chunk_stats,
            "overlapSubChunkStats": &self.overlap_sub_chunk_stats,
        });
        if verbosity < 0 {
            return doc;
        }
        let mut chunks: Vec<(i32, Entry)> = self.chunks.iter().map(|(&k, &v)| (k, v)).collect();
        chunks.sort_unstable_by_key(|&(id, _)| id);
        let mut sub_chunks: Vec<(i64, Entry)> = if verbosity > 0 {
            self.sub_chunks.iter().map(|(&k, &v)| (k, v)).collect()
        } else {
            Vec::new()
        };
        sub_chunks.sort_unstable_by_key(|&(id, _)| id);

        let mut sc = 0usize;
        let mut chunk_docs = Vec::with_capacity(chunks.len());
        for (chunk_id, e) in chunks {
            let mut doc = serde_json::json!({
                "id": chunk_id,
                "nrec": [e.num_records, e.num_overlap_records],
            });
            if verbosity > 0 {
                let mut subs = Vec::new();
                while sc < sub_chunks.len() && (sub_chunks[sc].0 >> 32) as i32 == chunk_id {
                    let (id, e) = sub_chunks[sc];
                    subs.push(serde_json::json!({
                        "id": (id & 0x0fff_ffff) as i32,
                        "nrec": [e.num_records, e.num_overlap_records],
                    }));
                    sc += 1;
                }
                doc["subchunks"] = serde_json::Value::Array(subs);
            }
            chunk_docs.push(doc);
        }
        doc["chunks"] = serde_json::Value::Array(chunk_docs);
        doc
    }

    pub fn clear(&mut self) {
        *self = ChunkIndex::default();
    }

    fn compute_stats(&mut self) {
        let mut counts = Vec::with_capacity(self.sub_chunks.len());
        let mut overlap_counts = Vec::with_capacity(self.sub_chunks.len());
        for e in self.chunks.values() {
            counts.push(e.num_records);
            overlap_counts.push(e.num_overlap_records);
        }
        self.chunk_stats = Stats::compute_from(&mut counts);
        self.overlap_chunk_stats = Stats::compute_from(&mut overlap_counts);
        counts.clear();
        overlap_counts.clear();
        for e in self.sub_chunks.values() {
            counts.push(e.num_records);
            overlap_counts.push(e.num_overlap_records);
        }
        self.sub_chunk_stats = Stats::compute_from(&mut counts);
        self.overlap_sub_chunk_stats = Stats::compute_from(&mut overlap_counts);
        self.modified = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(chunk: i32, sub: i32, overlap: bool) -> ChunkLocation {
        ChunkLocation::new(chunk, sub, overlap)
    }

    #[test]
    fn test_add_zero_is_noop() {
        let mut idx = ChunkIndex::new();
        idx.add(&loc(1, 1, false), 0);
        assert!(idx.is_empty());
    }

    #[test]
    fn test_chunk_counts_equal_sum_of_sub_chunks() {
        let mut idx = ChunkIndex::new();
        idx.add(&loc(5, 0, false), 3);
        idx.add(&loc(5, 1, false), 4);
        idx.add(&loc(5, 1, true), 2);
        assert_eq!(idx.chunk(5).num_records, 7);
        assert_eq!(idx.chunk(5).num_overlap_records, 2);
        assert_eq!(
            idx.chunk(5).num_records,
            idx.sub_chunk(5, 0).num_records + idx.sub_chunk(5, 1).num_records
        );
    }

    #[test]
    fn test_missing_keys_yield_empty_entry() {
        let idx = ChunkIndex::new();
        assert_eq!(*idx.chunk(42), Entry::default());
        assert_eq!(*idx.sub_chunk(42, 7), Entry::default());
        assert_eq!(idx.count(&loc(42, 7, true)), 0);
    }

    #[test]
    fn test_merge_accumulates() {
        let mut a = ChunkIndex::new();
        let mut b = ChunkIndex::new();
        a.add(&loc(1, 0, false), 5);
        b.add(&loc(1, 0, false), 3);
        b.add(&loc(2, 0, true), 1);
        a.merge(&b);
        assert_eq!(a.chunk(1).num_records, 8);
        assert_eq!(a.chunk(2).num_overlap_records, 1);
        // Merging an empty index changes nothing.
        a.merge(&ChunkIndex::new());
        assert_eq!(a.chunk(1).num_records, 8);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.bin");
        let mut idx = ChunkIndex::new();
        idx.add(&loc(3, 1, false), 10);
        idx.add(&loc(3, 2, true), 4);
        idx.add(&loc(9, 0, false), 1);
        idx.write(&path, true).unwrap();
        let back = ChunkIndex::from_path(&path).unwrap();
        assert_eq!(back.chunk(3).num_records, 10);
        assert_eq!(back.chunk(3).num_overlap_records, 4);
        assert_eq!(back.sub_chunk(9, 0).num_records, 1);
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn test_concatenation_equals_merge() {
        let dir = tempfile::tempdir().unwrap();
        let a_path = dir.path().join("a.bin");
        let b_path = dir.path().join("b.bin");
        let cat_path = dir.path().join("cat.bin");

        let mut a = ChunkIndex::new();
        a.add(&loc(1, 0, false), 5);
        a.write(&a_path, true).unwrap();
        let mut b = ChunkIndex::new();
        b.add(&loc(1, 0, false), 3);
        b.write(&b_path, true).unwrap();

        let mut bytes = std::fs::read(&a_path).unwrap();
        bytes.extend(std::fs::read(&b_path).unwrap());
        std::fs::write(&cat_path, bytes).unwrap();

        let merged = ChunkIndex::from_path(&cat_path).unwrap();
        assert_eq!(merged.chunk(1).num_records, 8);
    }

    #[test]
    fn test_incremental_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.bin");
        let mut a = ChunkIndex::new();
        a.add(&loc(1, 0, false), 5);
        a.write(&path, false).unwrap();
        let mut b = ChunkIndex::new();
        b.add(&loc(2, 0, false), 3);
        b.write(&path, false).unwrap();
        let merged = ChunkIndex::from_path(&path).unwrap();
        assert_eq!(merged.chunk(1).num_records, 5);
        assert_eq!(merged.chunk(2).num_records, 3);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, [0u8; 23]).unwrap();
        assert!(matches!(
            ChunkIndex::from_path(&path),
            Err(IndexFileError::BadSize { size: 23, .. })
        ));
    }

    #[test]
    fn test_empty_population_stats() {
        let mut idx = ChunkIndex::new();
        let s = idx.stats(Population::Chunks);
        assert_eq!(s.nrec, 0);
        assert_eq!(s.n, 0);
        assert!(s.sigma.is_nan());
        assert!(s.skewness.is_nan());
        assert!(s.kurtosis.is_nan());
    }

    #[test]
    fn test_quartiles() {
        let mut counts = vec![1, 2, 3, 4];
        let s = Stats::compute_from(&mut counts);
        assert_eq!(s.quartile, [2, 3, 4]);

        let mut single = vec![10];
        let s = Stats::compute_from(&mut single);
        assert_eq!(s.quartile, [10, 10, 10]);
        assert_eq!(s.min, 10);
        assert_eq!(s.max, 10);
        assert_eq!(s.mean, 10.0);
        assert_eq!(s.sigma, 0.0);
    }

    #[test]
    fn test_stats_cached_until_mutation() {
        let mut idx = ChunkIndex::new();
        idx.add(&loc(1, 0, false), 5);
        assert_eq!(idx.stats(Population::Chunks).nrec, 5);
        assert_eq!(idx.stats(Population::Chunks).nrec, 5);
        idx.add(&loc(1, 0, false), 5);
        assert_eq!(idx.stats(Population::Chunks).nrec, 10);
    }

    #[test]
    fn test_summary_lists_chunks_in_order() {
        let mut idx = ChunkIndex::new();
        idx.add(&loc(9, 0, false), 1);
        idx.add(&loc(3, 0, false), 2);
        let doc = idx.summary(0);
        let ids: Vec<i64> =
            doc["chunks"].as_array().unwrap().iter().map(|c| c["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 9]);
    }
}
