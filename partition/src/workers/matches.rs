//! The match partitioner worker.
//!
//! A match row references two positional entities. `map` computes the
//! non-overlap location of both and stores the row at each distinct
//! location, marking which side matched the output partition in a flags
//! field: `'1'` when only the first entity's partition holds the row,
//! `'2'` when only the second does, `'3'` when both entities fall in
//! the same chunk (a single output row). Two resolution modes exist:
//! by partitioning positions carried in the row, or by looking the
//! entity identifiers up in director object indexes.
//!
//! Positions farther apart than the subdivision overlap radius cannot
//! be joined without a network shuffle, so such rows fail the job.

use super::{ChunkWriter, OutputConfig};
use crate::chunk_index::ChunkIndex;
use crate::chunker::{ChunkLocation, Chunker};
use crate::csv::{self, RowEditor};
use crate::mapreduce::Worker;
use crate::object_index::ObjectIndexReader;
use crate::silo::{Record, Silo};
use crate::sphgeom::{ang_sep, cartesian, EPSILON_DEG};
use anyhow::{anyhow, Result};
use std::sync::Arc;

const FLAG_LEFT_MATCH: char = '1';
const FLAG_RIGHT_MATCH: char = '2';
const FLAG_FULL_MATCH: char = '3';

/// How the two match-row entities are resolved to chunk locations.
#[derive(Clone)]
pub enum MatchMode {
    /// Each side carries its own partitioning position.
    Position { pos1: (String, String), pos2: (String, String) },
    /// Each side carries a director identifier resolved through an
    /// object index.
    Id {
        id1: String,
        id2: String,
        index1: Arc<ObjectIndexReader>,
        index2: Arc<ObjectIndexReader>,
        abort_on_missing1: bool,
        abort_on_missing2: bool,
    },
}

#[derive(Clone)]
pub struct MatchWorkerConfig {
    pub in_fields: Vec<String>,
    pub delimiter: u8,
    pub mode: MatchMode,
    pub chunk_field: Option<String>,
    pub sub_chunk_field: String,
    pub flags_field: String,
    pub chunker: Chunker,
    pub out: OutputConfig,
    pub block_size: usize,
}

#[derive(Clone, Copy)]
enum Fields {
    Position { pos1: (usize, usize), pos2: (usize, usize) },
    Id { id1: usize, id2: usize },
}

pub struct MatchWorker {
    editor: RowEditor,
    fields: Fields,
    mode: MatchMode,
    chunk_field: Option<usize>,
    sub_chunk_field: usize,
    flags_field: usize,
    chunker: Chunker,
    writer: ChunkWriter,
    scratch: Vec<u8>,
}

impl MatchWorker {
    pub fn new(config: &MatchWorkerConfig) -> Result<Self> {
        let mut editor = RowEditor::new(config.in_fields.clone(), config.delimiter);
        let fields = match &config.mode {
            MatchMode::Position { pos1, pos2 } => Fields::Position {
                pos1: (editor.field(&pos1.0)?, editor.field(&pos1.1)?),
                pos2: (editor.field(&pos2.0)?, editor.field(&pos2.1)?),
            },
            MatchMode::Id { id1, id2, .. } => {
                Fields::Id { id1: editor.field(id1)?, id2: editor.field(id2)? }
            }
        };
        let chunk_field = config.chunk_field.as_deref().map(|f| editor.output_field(f));
        let sub_chunk_field = editor.output_field(&config.sub_chunk_field);
        let flags_field = editor.output_field(&config.flags_field);
        Ok(MatchWorker {
            editor,
            fields,
            mode: config.mode.clone(),
            chunk_field,
            sub_chunk_field,
            flags_field,
            chunker: config.chunker.clone(),
            writer: ChunkWriter::new(config.out.clone(), config.block_size, false),
            scratch: Vec::new(),
        })
    }

    fn emit(
        &mut self,
        loc: ChunkLocation,
        flag: char,
        silo: &mut Silo<ChunkLocation>,
    ) -> Result<()> {
        if let Some(chunk_field) = self.chunk_field {
            self.editor.set_i32(chunk_field, loc.chunk_id);
        }
        self.editor.set_i32(self.sub_chunk_field, loc.sub_chunk_id);
        self.editor.set_char(self.flags_field, flag);
        self.editor.write_to(&mut self.scratch);
        silo.add(loc, &self.scratch)?;
        Ok(())
    }

    /// Emit the current row at each resolved location, honoring the
    /// single-emission rule for pairs sharing a chunk.
    fn emit_pair(
        &mut self,
        loc1: Option<ChunkLocation>,
        loc2: Option<ChunkLocation>,
        silo: &mut Silo<ChunkLocation>,
    ) -> Result<()> {
        if let Some(loc1) = loc1 {
            if let Some(loc2) = loc2 {
                if loc1.chunk_id == loc2.chunk_id {
                    // Both entities are in the same chunk.
                    return self.emit(loc1, FLAG_FULL_MATCH, silo);
                }
            }
            self.emit(loc1, FLAG_LEFT_MATCH, silo)?;
        }
        if let Some(loc2) = loc2 {
            self.emit(loc2, FLAG_RIGHT_MATCH, silo)?;
        }
        Ok(())
    }

    fn map_by_position(&mut self, block: &[u8], silo: &mut Silo<ChunkLocation>) -> Result<()> {
        let Fields::Position { pos1, pos2 } = self.fields else {
            unreachable!("position mapping requires position fields");
        };
        for line in csv::lines(block) {
            self.editor.read_line(line)?;
            let null1 = self.editor.is_null(pos1.0) || self.editor.is_null(pos1.1);
            let null2 = self.editor.is_null(pos2.0) || self.editor.is_null(pos2.1);
            if null1 && null2 {
                return Err(anyhow!(
                    "both partitioning positions in a match record contain NULLs"
                ));
            }
            let mut sc1 = (0.0, 0.0);
            let mut sc2 = (0.0, 0.0);
            let mut loc1 = None;
            let mut loc2 = None;
            if !null1 {
                sc1 = (self.editor.get_f64(pos1.0)?, self.editor.get_f64(pos1.1)?);
                loc1 = Some(self.chunker.locate(sc1.0, sc1.1));
            }
            if !null2 {
                sc2 = (self.editor.get_f64(pos2.0)?, self.editor.get_f64(pos2.1)?);
                loc2 = Some(self.chunker.locate(sc2.0, sc2.1));
            }
            if !null1 && !null2 {
                let sep = ang_sep(cartesian(sc1.0, sc1.1), cartesian(sc2.0, sc2.1));
                if sep > self.chunker.overlap() - EPSILON_DEG {
                    return Err(anyhow!(
                        "match positions (lon: {}, lat: {}) and (lon: {}, lat: {}) are \
                         separated by {} degrees, more than the overlap radius {}",
                        sc1.0,
                        sc1.1,
                        sc2.0,
                        sc2.1,
                        sep,
                        self.chunker.overlap()
                    ));
                }
            }
            self.emit_pair(loc1, loc2, silo)?;
        }
        Ok(())
    }

    fn map_by_object_index(&mut self, block: &[u8], silo: &mut Silo<ChunkLocation>) -> Result<()> {
        let Fields::Id { id1, id2 } = self.fields else {
            unreachable!("identifier mapping requires identifier fields");
        };
        let MatchMode::Id {
            index1, index2, abort_on_missing1, abort_on_missing2, ..
        } = self.mode.clone()
        else {
            unreachable!("identifier mapping requires the identifier mode");
        };
        for line in csv::lines(block) {
            self.editor.read_line(line)?;
            let loc1 = Self::resolve(&self.editor, id1, &index1, abort_on_missing1)?;
            let loc2 = Self::resolve(&self.editor, id2, &index2, abort_on_missing2)?;
            if loc1.is_none() && loc2.is_none() {
                return Err(anyhow!(
                    "both identifiers in a match record are NULL or missing from the \
                     object indexes"
                ));
            }
            self.emit_pair(loc1, loc2, silo)?;
        }
        Ok(())
    }

    /// Resolve one identifier field to a location. A NULL identifier
    /// yields `None`; an unknown one fails the row or is logged,
    /// depending on the abort policy.
    fn resolve(
        editor: &RowEditor,
        field: usize,
        index: &ObjectIndexReader,
        abort_on_missing: bool,
    ) -> Result<Option<ChunkLocation>> {
        let Some(id) = editor.get_str(field) else {
            return Ok(None);
        };
        match index.get(id) {
            Some((chunk_id, sub_chunk_id)) => {
                Ok(Some(ChunkLocation::new(chunk_id, sub_chunk_id, false)))
            }
            None if abort_on_missing => {
                Err(anyhow!("no entry for identifier {id} was found in the object index"))
            }
            None => {
                tracing::warn!(id, "no object index entry for identifier, emitting one side only");
                Ok(None)
            }
        }
    }
}

impl Worker for MatchWorker {
    type Key = ChunkLocation;
    type Output = ChunkIndex;

    fn map(&mut self, block: &[u8], silo: &mut Silo<ChunkLocation>) -> Result<()> {
        match self.fields {
            Fields::Position { .. } => self.map_by_position(block, silo),
            Fields::Id { .. } => self.map_by_object_index(block, silo),
        }
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
    use crate::input::InputLines;
    use crate::mapreduce::{EngineOptions, Job};
    use crate::object_index::ObjectIndexWriter;

    fn run(
        dir: &std::path::Path,
        rows: &str,
        mode: MatchMode,
        overlap: f64,
    ) -> Result<ChunkIndex> {
        let input_path = dir.join("matches.csv");
        std::fs::write(&input_path, rows).unwrap();
        let out_dir = dir.join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let cfg = MatchWorkerConfig {
            in_fields: vec!["ra1".into(), "dec1".into(), "ra2".into(), "dec2".into()],
            delimiter: b',',
            mode,
            chunk_field: Some("chunkId".into()),
            sub_chunk_field: "subChunkId".into(),
            flags_field: "partitioningFlags".into(),
            chunker: Chunker::new(18, 5, overlap).unwrap(),
            out: OutputConfig {
                dir: out_dir,
                num_nodes: 1,
                prefix: "match".to_string(),
            },
            block_size: 1024,
        };
        let options = EngineOptions { block_size_mib: 1, num_workers: 1, pool_size_mib: 8 };
        let job = Job::new(&options)?;
        let input = InputLines::new(vec![input_path], options.block_size());
        Ok(job.run(&input, || MatchWorker::new(&cfg))?.unwrap_or_default())
    }

    fn position_mode() -> MatchMode {
        MatchMode::Position {
            pos1: ("ra1".into(), "dec1".into()),
            pos2: ("ra2".into(), "dec2".into()),
        }
    }

    #[test]
    fn test_same_chunk_pair_emitted_once() {
        let dir = tempfile::tempdir().unwrap();
        let index =
            run(dir.path(), "10.0, 5.0, 10.001, 5.0\n", position_mode(), 0.01667).unwrap();
        let chunker = Chunker::new(18, 5, 0.01667).unwrap();
        let loc = chunker.locate(10.0, 5.0);
        assert_eq!(index.chunk(loc.chunk_id).num_records, 1);
        let content = std::fs::read_to_string(
            dir.path().join("out").join(format!("match_{}.txt", loc.chunk_id)),
        )
        .unwrap();
        assert!(content.trim_end().ends_with(",3"), "full-match flag expected: {content}");
    }

    #[test]
    fn test_cross_chunk_pair_emitted_to_both_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        // Positions straddling the lat = 0 stripe boundary, within the
        // overlap radius of each other.
        let index =
            run(dir.path(), "10.0, -0.001, 10.0, 0.001\n", position_mode(), 0.01667).unwrap();
        let chunker = Chunker::new(18, 5, 0.01667).unwrap();
        let loc1 = chunker.locate(10.0, -0.001);
        let loc2 = chunker.locate(10.0, 0.001);
        assert_ne!(loc1.chunk_id, loc2.chunk_id, "fixture must straddle a chunk boundary");
        assert_eq!(index.chunk(loc1.chunk_id).num_records, 1);
        assert_eq!(index.chunk(loc2.chunk_id).num_records, 1);
        let left = std::fs::read_to_string(
            dir.path().join("out").join(format!("match_{}.txt", loc1.chunk_id)),
        )
        .unwrap();
        let right = std::fs::read_to_string(
            dir.path().join("out").join(format!("match_{}.txt", loc2.chunk_id)),
        )
        .unwrap();
        assert!(left.trim_end().ends_with(",1"));
        assert!(right.trim_end().ends_with(",2"));
    }

    #[test]
    fn test_overlap_violation_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(dir.path(), "10.0, 5.0, 11.0, 5.0\n", position_mode(), 0.01667)
            .unwrap_err();
        assert!(err.to_string().contains("overlap radius"));
    }

    #[test]
    fn test_both_null_positions_fail_job() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            run(dir.path(), "\\N, \\N, \\N, \\N\n", position_mode(), 0.01667).unwrap_err();
        assert!(err.to_string().contains("NULL"));
    }

    #[test]
    fn test_one_null_position_emits_single_side() {
        let dir = tempfile::tempdir().unwrap();
        let index = run(dir.path(), "10.0, 5.0, \\N, \\N\n", position_mode(), 0.01667).unwrap();
        let chunker = Chunker::new(18, 5, 0.01667).unwrap();
        let loc = chunker.locate(10.0, 5.0);
        assert_eq!(index.chunk(loc.chunk_id).num_records, 1);
    }

    fn id_mode(dir: &std::path::Path, abort1: bool, abort2: bool) -> MatchMode {
        // Build two tiny director indexes.
        let idx1 = dir.join("idx1.tsv");
        let idx2 = dir.join("idx2.tsv");
        let w1 = ObjectIndexWriter::create(idx1.to_str().unwrap()).unwrap();
        w1.append("100", 40, 1).unwrap();
        w1.finish().unwrap();
        let w2 = ObjectIndexWriter::create(idx2.to_str().unwrap()).unwrap();
        w2.append("200", 41, 2).unwrap();
        w2.append("201", 40, 3).unwrap();
        w2.finish().unwrap();
        MatchMode::Id {
            id1: "ra1".into(),
            id2: "ra2".into(),
            index1: Arc::new(ObjectIndexReader::open(idx1.to_str().unwrap()).unwrap()),
            index2: Arc::new(ObjectIndexReader::open(idx2.to_str().unwrap()).unwrap()),
            abort_on_missing1: abort1,
            abort_on_missing2: abort2,
        }
    }

    #[test]
    fn test_id_mode_resolves_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let mode = id_mode(dir.path(), true, true);
        let index = run(dir.path(), "100, 0, 200, 0\n", mode, 0.01667).unwrap();
        assert_eq!(index.chunk(40).num_records, 1);
        assert_eq!(index.chunk(41).num_records, 1);
    }

    #[test]
    fn test_id_mode_same_chunk_single_emission() {
        let dir = tempfile::tempdir().unwrap();
        let mode = id_mode(dir.path(), true, true);
        let index = run(dir.path(), "100, 0, 201, 0\n", mode, 0.01667).unwrap();
        assert_eq!(index.chunk(40).num_records, 1);
        assert_eq!(index.chunk(41).num_records, 0);
    }

    #[test]
    fn test_id_mode_missing_aborts_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mode = id_mode(dir.path(), true, true);
        let err = run(dir.path(), "100, 0, 999, 0\n", mode, 0.01667).unwrap_err();
        assert!(err.to_string().contains("no entry"));
    }

    #[test]
    fn test_id_mode_missing_tolerated_otherwise() {
        let dir = tempfile::tempdir().unwrap();
        let mode = id_mode(dir.path(), false, false);
        let index = run(dir.path(), "100, 0, 999, 0\n", mode, 0.01667).unwrap();
        assert_eq!(index.chunk(40).num_records, 1);
    }

    #[test]
    fn test_id_mode_both_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mode = id_mode(dir.path(), false, false);
        let err = run(dir.path(), "888, 0, 999, 0\n", mode, 0.01667).unwrap_err();
        assert!(err.to_string().contains("NULL or missing"));
    }
}
