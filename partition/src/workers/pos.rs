//! The positional partitioner worker.
//!
//! `map` assigns each input row to the chunk and sub-chunk containing
//! its partitioning position, and stores an additional copy of the row
//! at every sub-chunk whose overlap region contains the position.
//! `reduce` bucket-writes the rows into per-chunk files via
//! [`ChunkWriter`]. The worker output is a [`ChunkIndex`] with the
//! record counts seen by that worker.

use super::{ChunkWriter, OutputConfig};
use crate::chunk_index::ChunkIndex;
use crate::chunker::{ChunkLocation, Chunker};
use crate::csv::{self, RowEditor};
use crate::mapreduce::Worker;
use crate::object_index::ObjectIndexWriter;
use crate::silo::{Record, Silo};
use anyhow::{anyhow, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct PosWorkerConfig {
    pub in_fields: Vec<String>,
    pub delimiter: u8,
    /// Longitude and latitude field names.
    pub pos: (String, String),
    /// Object identifier field; when set, an object index entry is
    /// emitted for every row's home location.
    pub id_field: Option<String>,
    /// Chunk ID output field name, if the output should carry one.
    pub chunk_field: Option<String>,
    pub sub_chunk_field: String,
    pub chunker: Chunker,
    pub out: OutputConfig,
    pub block_size: usize,
    pub object_index: Option<Arc<ObjectIndexWriter>>,
}

pub struct PosWorker {
    editor: RowEditor,
    lon_field: usize,
    lat_field: usize,
    id_field: Option<usize>,
    chunk_field: Option<usize>,
    sub_chunk_field: usize,
    chunker: Chunker,
    object_index: Option<Arc<ObjectIndexWriter>>,
    writer: ChunkWriter,
    overlap_locs: Vec<ChunkLocation>,
    scratch: Vec<u8>,
}

impl PosWorker {
    pub fn new(config: &PosWorkerConfig) -> Result<Self> {
        let mut editor = RowEditor::new(config.in_fields.clone(), config.delimiter);
        let lon_field = editor.field(&config.pos.0)?;
        let lat_field = editor.field(&config.pos.1)?;
        let id_field = config.id_field.as_deref().map(|f| editor.field(f)).transpose()?;
        let chunk_field = config.chunk_field.as_deref().map(|f| editor.output_field(f));
        let sub_chunk_field = editor.output_field(&config.sub_chunk_field);
        if id_field.is_some() != config.object_index.is_some() {
            return Err(anyhow!("an object identifier field requires an index writer"));
        }
        Ok(PosWorker {
            editor,
            lon_field,
            lat_field,
            id_field,
            chunk_field,
            sub_chunk_field,
            chunker: config.chunker.clone(),
            object_index: config.object_index.clone(),
            writer: ChunkWriter::new(config.out.clone(), config.block_size, true),
            overlap_locs: Vec::new(),
            scratch: Vec::new(),
        })
    }

    fn set_location(&mut self, loc: &ChunkLocation) {
        if let Some(chunk_field) = self.chunk_field {
            self.editor.set_i32(chunk_field, loc.chunk_id);
        }
        self.editor.set_i32(self.sub_chunk_field, loc.sub_chunk_id);
    }
}

impl Worker for PosWorker {
    type Key = ChunkLocation;
    type Output = ChunkIndex;

    fn map(&mut self, block: &[u8], silo: &mut Silo<ChunkLocation>) -> Result<()> {
        for line in csv::lines(block) {
            self.editor.read_line(line)?;
            let lon = self.editor.get_f64(self.lon_field)?;
            let lat = self.editor.get_f64(self.lat_field)?;
            let loc = self.chunker.locate(lon, lat);

            self.set_location(&loc);
            self.editor.write_to(&mut self.scratch);
            silo.add(loc, &self.scratch)?;

            if let (Some(id_field), Some(index)) = (self.id_field, &self.object_index) {
                let id = self
                    .editor
                    .get_str(id_field)
                    .ok_or_else(|| anyhow!("NULL object identifier in input row"))?;
                index.append(id, loc.chunk_id, loc.sub_chunk_id)?;
            }

            self.overlap_locs.clear();
            self.chunker.overlap_locations(lon, lat, &mut self.overlap_locs);
            for i in 0..self.overlap_locs.len() {
                let overlap_loc = self.overlap_locs[i];
                self.set_location(&overlap_loc);
                self.editor.write_to(&mut self.scratch);
                silo.add(overlap_loc, &self.scratch)?;
            }
        }
        Ok(())
    }

    fn reduce(
        &mut self,
        silo: &Silo<ChunkLocation>,
        records: &[Record<ChunkLocation>],
    ) -> Result<()> {
        self.writer.write(silo, records)
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.finish()
    }

    fn into_output(self) -> Option<ChunkIndex> {
        Some(self.writer.into_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapreduce::{EngineOptions, Job};
    use crate::input::InputLines;

    fn config(dir: &std::path::Path, overlap: f64) -> PosWorkerConfig {
        PosWorkerConfig {
            in_fields: vec!["id".into(), "ra".into(), "dec".into()],
            delimiter: b',',
            pos: ("ra".into(), "dec".into()),
            id_field: None,
            chunk_field: Some("chunkId".into()),
            sub_chunk_field: "subChunkId".into(),
            chunker: Chunker::new(18, 5, overlap).unwrap(),
            out: OutputConfig {
                dir: dir.to_path_buf(),
                num_nodes: 1,
                prefix: "chunk".to_string(),
            },
            block_size: 1024,
            object_index: None,
        }
    }

    #[test]
    fn test_rows_partitioned_into_chunk_files() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("in.csv");
        std::fs::write(&input_path, "1, 2.0, 3.0\n2, 2.1, 3.1\n").unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();

        let cfg = config(&out_dir, 0.01667);
        let options = EngineOptions { block_size_mib: 1, num_workers: 2, pool_size_mib: 8 };
        let job = Job::new(&options).unwrap();
        let input = InputLines::new(vec![input_path], options.block_size());
        let index = job.run(&input, || PosWorker::new(&cfg)).unwrap().unwrap();

        // Both rows counted exactly once as regular records.
        let total: u64 = (0..2 * 18 * 2 * 18).map(|c| index.chunk(c).num_records).sum();
        assert_eq!(total, 2);

        // The chunk file carries the chunk ID column.
        let chunker = Chunker::new(18, 5, 0.01667).unwrap();
        let loc = chunker.locate(2.0, 3.0);
        let chunk_file = out_dir.join(format!("chunk_{}.txt", loc.chunk_id));
        let content = std::fs::read_to_string(&chunk_file).unwrap();
        assert!(content.contains(&format!("{}", loc.chunk_id)));
    }

    #[test]
    fn test_overlap_rows_written_to_overlap_files() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("in.csv");
        // A position just north of the lat = 2 sub-stripe boundary has
        // at least one overlap neighbor to the south.
        std::fs::write(&input_path, "1, 45.0, 2.000001\n").unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();

        let cfg = config(&out_dir, 0.01667);
        let options = EngineOptions { block_size_mib: 1, num_workers: 1, pool_size_mib: 8 };
        let job = Job::new(&options).unwrap();
        let input = InputLines::new(vec![input_path], options.block_size());
        let mut index = job.run(&input, || PosWorker::new(&cfg)).unwrap().unwrap();

        let stats = index.stats(crate::chunk_index::Population::OverlapSubChunks);
        assert!(stats.nrec >= 1, "expected at least one overlap record");
    }

    #[test]
    fn test_object_index_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("in.csv");
        std::fs::write(&input_path, "901, 10.0, -5.0\n902, 11.0, -5.5\n").unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let index_path = out_dir.join("object_index.tsv");

        let mut cfg = config(&out_dir, 0.0);
        cfg.id_field = Some("id".into());
        cfg.object_index =
            Some(Arc::new(ObjectIndexWriter::create(index_path.to_str().unwrap()).unwrap()));
        let options = EngineOptions { block_size_mib: 1, num_workers: 1, pool_size_mib: 8 };
        let job = Job::new(&options).unwrap();
        let input = InputLines::new(vec![input_path], options.block_size());
        job.run(&input, || PosWorker::new(&cfg)).unwrap();
        cfg.object_index.as_ref().unwrap().finish().unwrap();

        let reader = crate::object_index::ObjectIndexReader::open(index_path.to_str().unwrap())
            .unwrap();
        let chunker = Chunker::new(18, 5, 0.0).unwrap();
        let loc = chunker.locate(10.0, -5.0);
        assert_eq!(reader.get("901"), Some((loc.chunk_id, loc.sub_chunk_id)));
        assert_eq!(reader.len(), 2);
    }
}
