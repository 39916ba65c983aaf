//! Map-reduce workers for the positional and match partitioners.

pub mod matches;
pub mod pos;

use crate::chunk_index::ChunkIndex;
use crate::chunker::ChunkLocation;
use crate::mapreduce::Merge;
use crate::output::{chunk_file_path, hash_chunk, BufferedAppender};
use crate::silo::{Record, Silo, SiloKey};
use anyhow::Result;
use std::path::PathBuf;

// All records of a chunk hash alike so one reducer owns the whole
// chunk and writes its files alone.
impl SiloKey for ChunkLocation {
    fn hash32(&self) -> u32 {
        hash_chunk(self.chunk_id)
    }
}

impl Merge for ChunkIndex {
    fn merge(&mut self, other: ChunkIndex) {
        ChunkIndex::merge(self, &other);
    }
}

/// Output directory parameters shared by both partitioner variants.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub num_nodes: u32,
    pub prefix: String,
}

/// The reduction half of both partitioner workers: saves records to
/// per-chunk files and tracks per-chunk and sub-chunk record counts.
///
/// Records arrive in ascending key order within a phase and a reducer
/// owns every record of each of its chunks, so a chunk ID transition
/// means the previous chunk's files are complete for this phase. Files
/// are opened in append mode: later phases, and later partitioner runs
/// over disjoint inputs, extend them.
pub struct ChunkWriter {
    index: ChunkIndex,
    out: OutputConfig,
    chunk_id: Option<i32>,
    chunk: BufferedAppender,
    overlap: Option<BufferedAppender>,
}

impl ChunkWriter {
    /// `with_overlap` controls whether `<prefix>_<id>_overlap.txt`
    /// files are produced; match tables have no overlap copies.
    pub fn new(out: OutputConfig, block_size: usize, with_overlap: bool) -> Self {
        ChunkWriter {
            index: ChunkIndex::new(),
            out,
            chunk_id: None,
            chunk: BufferedAppender::new(block_size),
            overlap: with_overlap.then(|| BufferedAppender::new(block_size)),
        }
    }

    pub fn write(
        &mut self,
        silo: &Silo<ChunkLocation>,
        records: &[Record<ChunkLocation>],
    ) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let chunk_id = first.key.chunk_id;
        if self.chunk_id != Some(chunk_id) {
            self.chunk_id = Some(chunk_id);
            self.open(chunk_id)?;
        }
        for record in records {
            self.index.add(&record.key, 1);
            let data = silo.data(record);
            match (&mut self.overlap, record.key.overlap) {
                (Some(overlap), true) => overlap.append(data)?,
                _ => self.chunk.append(data)?,
            }
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.chunk_id = None;
        self.chunk.close()?;
        if let Some(overlap) = &mut self.overlap {
            overlap.close()?;
        }
        Ok(())
    }

    pub fn into_index(self) -> ChunkIndex {
        self.index
    }

    fn open(&mut self, chunk_id: i32) -> Result<()> {
        let path =
            chunk_file_path(&self.out.dir, self.out.num_nodes, &self.out.prefix, chunk_id, false)?;
        self.chunk.open(path, false)?;
        if let Some(overlap) = &mut self.overlap {
            let path = chunk_file_path(
                &self.out.dir,
                self.out.num_nodes,
                &self.out.prefix,
                chunk_id,
                true,
            )?;
            overlap.open(path, false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::silo::Silo;

    #[test]
    fn test_chunk_location_hash_ignores_sub_chunk() {
        let a = ChunkLocation::new(7, 1, false);
        let b = ChunkLocation::new(7, 99, true);
        assert_eq!(a.hash32(), b.hash32());
        let c = ChunkLocation::new(8, 1, false);
        assert_ne!(a.hash32(), c.hash32());
    }

    #[test]
    fn test_chunk_writer_separates_overlap_records() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputConfig {
            dir: dir.path().to_path_buf(),
            num_nodes: 1,
            prefix: "chunk".to_string(),
        };
        let mut writer = ChunkWriter::new(out, 1024, true);

        let mut silo: Silo<ChunkLocation> = Silo::new();
        silo.add(ChunkLocation::new(3, 0, false), b"a\n").unwrap();
        silo.add(ChunkLocation::new(3, 0, true), b"b\n").unwrap();
        silo.sort();
        let records = silo.records();
        writer.write(&silo, &records[..1]).unwrap();
        writer.write(&silo, &records[1..]).unwrap();
        writer.finish().unwrap();

        assert_eq!(std::fs::read(dir.path().join("chunk_3.txt")).unwrap(), b"a\n");
        assert_eq!(std::fs::read(dir.path().join("chunk_3_overlap.txt")).unwrap(), b"b\n");
        let index = writer.into_index();
        assert_eq!(index.chunk(3).num_records, 1);
        assert_eq!(index.chunk(3).num_overlap_records, 1);
    }
}
