//! Buffered chunk-file output and the downstream node directory layout.
//!
//! Chunk ID C is assigned to downstream node `hash(C) mod N`, where N is
//! the total node count. Chunk files land in node-specific
//! sub-directories `node_XXXXX` (`XXXXX` is the node number, zero
//! padded); with a single node the files go directly into the output
//! directory.
//!
//! A partitioned data set can be built up incrementally by running the
//! partitioner with disjoint input file sets and the same output
//! directory, so the chunk-to-node assignment must be stable across
//! processes and platforms. FNV-1a over the little-endian chunk ID
//! serves as that hash.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// FNV-1a, the stable 32-bit hash used for chunk-to-node and
/// chunk-to-reducer assignment.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

pub fn hash_chunk(chunk_id: i32) -> u32 {
    fnv1a32(&chunk_id.to_le_bytes())
}

/// The downstream node that owns a chunk.
pub fn node_of(chunk_id: i32, num_nodes: u32) -> u32 {
    hash_chunk(chunk_id) % num_nodes
}

/// The path of a chunk file, creating the node sub-directory when the
/// layout calls for one.
pub fn chunk_file_path(
    out_dir: &Path,
    num_nodes: u32,
    prefix: &str,
    chunk_id: i32,
    overlap: bool,
) -> Result<PathBuf> {
    let mut dir = out_dir.to_path_buf();
    if num_nodes > 1 {
        dir.push(format!("node_{:05}", node_of(chunk_id, num_nodes)));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create node directory {}", dir.display()))?;
    }
    let suffix = if overlap { "_overlap" } else { "" };
    Ok(dir.join(format!("{prefix}_{chunk_id}{suffix}.txt")))
}

/// An appender that batches writes into block-sized buffers. Opening a
/// new path flushes and closes the previous one.
pub struct BufferedAppender {
    buf: Vec<u8>,
    capacity: usize,
    file: Option<(File, PathBuf)>,
}

impl BufferedAppender {
    pub fn new(capacity: usize) -> Self {
        BufferedAppender { buf: Vec::with_capacity(capacity), capacity, file: None }
    }

    /// Open `path` for appending (or truncation), closing any
    /// previously open file first.
    pub fn open(&mut self, path: PathBuf, truncate: bool) -> Result<()> {
        self.close()?;
        let file = OpenOptions::new()
            .create(true)
            .append(!truncate)
            .write(truncate)
            .truncate(truncate)
            .open(&path)
            .with_context(|| format!("failed to open chunk file {}", path.display()))?;
        self.file = Some((file, path));
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() + data.len() > self.capacity {
            self.flush()?;
        }
        if data.len() >= self.capacity {
            // Oversized writes bypass the buffer.
            let (file, path) = self.file.as_mut().context("append on a closed appender")?;
            return file
                .write_all(data)
                .with_context(|| format!("failed to write chunk file {}", path.display()));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.file = None;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let (file, path) = self.file.as_mut().context("buffered data with no open file")?;
        file.write_all(&self.buf)
            .with_context(|| format!("failed to write chunk file {}", path.display()))?;
        self.buf.clear();
        Ok(())
    }
}

impl Drop for BufferedAppender {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("failed to flush chunk file on drop: {e:#}");
        }
    }
}
