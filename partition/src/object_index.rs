//! The director object index: a `objectId -> (chunkId, subChunkId)` map.
//!
//! The positional partitioner emits one in write mode when asked to; the
//! match partitioner reads one per matched side to resolve partition
//! locations for rows that carry identifiers instead of positions. The
//! format is tab-separated text, one `id<TAB>chunkId<TAB>subChunkId`
//! line per object.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Strip an optional `file://` scheme; remote index URLs are not
/// supported.
fn url_to_path(url: &str) -> Result<&Path> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Ok(Path::new(rest));
    }
    if url.contains("://") {
        return Err(anyhow!("unsupported object index URL scheme: {url}"));
    }
    Ok(Path::new(url))
}

/// A fully loaded, read-only object index.
pub struct ObjectIndexReader {
    map: HashMap<String, (i32, i32)>,
}

impl ObjectIndexReader {
    pub fn open(url: &str) -> Result<Self> {
        let path = url_to_path(url)?;
        let file = File::open(path)
            .with_context(|| format!("failed to open object index {}", path.display()))?;
        let mut map = HashMap::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let entry = (|| {
                let id = fields.next()?;
                let chunk = fields.next()?.parse().ok()?;
                let sub_chunk = fields.next()?.parse().ok()?;
                Some((id.to_string(), (chunk, sub_chunk)))
            })()
            .ok_or_else(|| {
                anyhow!("malformed object index line {} in {}", lineno + 1, path.display())
            })?;
            map.insert(entry.0, entry.1);
        }
        tracing::info!(entries = map.len(), index = %path.display(), "loaded object index");
        Ok(ObjectIndexReader { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The location of an object, or `None` for an unknown identifier.
    /// Whether a miss aborts the run is the caller's policy.
    pub fn get(&self, id: &str) -> Option<(i32, i32)> {
        self.map.get(id).copied()
    }
}

/// An internally synchronized object index writer shared by all map
/// workers of one partitioning run.
pub struct ObjectIndexWriter {
    inner: Mutex<BufWriter<File>>,
}

impl ObjectIndexWriter {
    pub fn create(url: &str) -> Result<Self> {
        let path = url_to_path(url)?;
        let file = File::create(path)
            .with_context(|| format!("failed to create object index {}", path.display()))?;
        Ok(ObjectIndexWriter { inner: Mutex::new(BufWriter::new(file)) })
    }

    pub fn append(&self, id: &str, chunk_id: i32, sub_chunk_id: i32) -> Result<()> {
        let mut w = self.inner.lock().expect("object index lock poisoned");
        writeln!(w, "{id}\t{chunk_id}\t{sub_chunk_id}").context("failed to write object index")
    }

    pub fn finish(&self) -> Result<()> {
        self.inner.lock().expect("object index lock poisoned").flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.tsv");
        let url = path.to_str().unwrap().to_string();
        let w = ObjectIndexWriter::create(&url).unwrap();
        w.append("9000", 12, 3).unwrap();
        w.append("9001", 12, 4).unwrap();
        w.finish().unwrap();

        let r = ObjectIndexReader::open(&url).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r.get("9000"), Some((12, 3)));
        assert_eq!(r.get("9001"), Some((12, 4)));
        assert_eq!(r.get("9002"), None);
    }

    #[test]
    fn test_file_url_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.tsv");
        std::fs::write(&path, "1\t2\t3\n").unwrap();
        let url = format!("file://{}", path.display());
        let r = ObjectIndexReader::open(&url).unwrap();
        assert_eq!(r.get("1"), Some((2, 3)));
    }

    #[test]
    fn test_remote_scheme_rejected() {
        assert!(ObjectIndexReader::open("http://example.com/idx").is_err());
    }

    #[test]
    fn test_malformed_line_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.tsv");
        std::fs::write(&path, "1\t2\n").unwrap();
        assert!(ObjectIndexReader::open(path.to_str().unwrap()).is_err());
    }
}
