//! Command line surface of the partitioner and the job drivers behind
//! the subcommands.

use crate::chunk_index::ChunkIndex;
use crate::chunker::Chunker;
use crate::csv::parse_field_pair;
use crate::input::InputLines;
use crate::mapreduce::{EngineOptions, Job};
use crate::object_index::{ObjectIndexReader, ObjectIndexWriter};
use crate::workers::matches::{MatchMode, MatchWorker, MatchWorkerConfig};
use crate::workers::pos::{PosWorker, PosWorkerConfig};
use crate::workers::OutputConfig;
use anyhow::{anyhow, Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

pub const MAX_NUM_NODES: u32 = 99_999;

/// Options shared by both partitioner variants.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Input CSV file. Repeatable.
    #[arg(long = "in", value_name = "FILE", required = true)]
    pub input: Vec<PathBuf>,

    /// Input field names, in file order, comma separated.
    #[arg(long = "in-fields", value_delimiter = ',', required = true)]
    pub in_fields: Vec<String>,

    /// Input field delimiter.
    #[arg(long, default_value_t = ',')]
    pub delimiter: char,

    /// Output directory.
    #[arg(long = "out-dir")]
    pub out_dir: PathBuf,

    /// Downstream node count; chunk files are grouped into one
    /// sub-directory per node.
    #[arg(long = "out-num-nodes", default_value_t = 1)]
    pub num_nodes: u32,

    /// Chunk file name prefix.
    #[arg(long = "part-prefix", default_value = "chunk")]
    pub prefix: String,

    /// The number of latitude stripes.
    #[arg(long = "part-num-stripes", default_value_t = 18)]
    pub num_stripes: i32,

    /// The number of sub-stripes in each stripe.
    #[arg(long = "part-num-sub-stripes-per-stripe", default_value_t = 100)]
    pub num_sub_stripes_per_stripe: i32,

    /// Overlap radius in degrees.
    #[arg(long = "part-overlap", default_value_t = 0.01667)]
    pub overlap: f64,

    /// Chunk ID output field name. Appended to the output field list
    /// when not already included.
    #[arg(long = "part-chunk")]
    pub chunk_field: Option<String>,

    /// Sub-chunk ID output field name. Appended to the output field
    /// list when not already included.
    #[arg(long = "part-sub-chunk", default_value = "subChunkId")]
    pub sub_chunk_field: String,

    /// The IO block size in MiB, 1 to 1024.
    #[arg(long = "mr-block-size", default_value_t = 4)]
    pub block_size_mib: usize,

    /// The number of worker threads, at least 1.
    #[arg(long = "mr-num-workers", default_value_t = 1)]
    pub num_workers: usize,

    /// Memory pool size in MiB; a soft limit on data accumulated
    /// between reduction passes.
    #[arg(long = "mr-pool-size", default_value_t = 1024)]
    pub pool_size_mib: usize,
}

impl CommonArgs {
    fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 || self.num_nodes > MAX_NUM_NODES {
            return Err(anyhow!(
                "--out-num-nodes must be between 1 and {MAX_NUM_NODES}, got {}",
                self.num_nodes
            ));
        }
        if !self.delimiter.is_ascii() {
            return Err(anyhow!("--delimiter must be a single ASCII character"));
        }
        Ok(())
    }

    fn chunker(&self) -> Result<Chunker> {
        Ok(Chunker::new(self.num_stripes, self.num_sub_stripes_per_stripe, self.overlap)?)
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            block_size_mib: self.block_size_mib,
            num_workers: self.num_workers,
            pool_size_mib: self.pool_size_mib,
        }
    }

    fn output(&self) -> OutputConfig {
        OutputConfig {
            dir: self.out_dir.clone(),
            num_nodes: self.num_nodes,
            prefix: self.prefix.clone(),
        }
    }
}

/// Options of the positional partitioner.
#[derive(Args, Debug, Clone)]
pub struct PosArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// The partitioning longitude and latitude field names, separated
    /// by a comma.
    #[arg(long = "part-pos")]
    pub pos: String,

    /// Object identifier field name. When given, a director object
    /// index mapping each identifier to its chunk and sub-chunk is
    /// emitted alongside the chunk files.
    #[arg(long = "part-id")]
    pub id_field: Option<String>,

    /// Location for the emitted object index; defaults to
    /// `<out-dir>/<prefix>_object_index.tsv`.
    #[arg(long = "part-id-url")]
    pub id_url: Option<String>,
}

/// Options of the match-table partitioner.
#[derive(Args, Debug, Clone)]
pub struct MatchArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Longitude and latitude field names of the first matched entity,
    /// separated by a comma.
    #[arg(long = "part-pos1")]
    pub pos1: Option<String>,

    /// Longitude and latitude field names of the second matched
    /// entity, separated by a comma.
    #[arg(long = "part-pos2")]
    pub pos2: Option<String>,

    /// Identifier field name of the first matched entity. Mutually
    /// exclusive with the position options.
    #[arg(long = "part-id1")]
    pub id1: Option<String>,

    /// Identifier field name of the second matched entity.
    #[arg(long = "part-id2")]
    pub id2: Option<String>,

    /// Location of the first entity's director object index.
    #[arg(long = "part-id1-url")]
    pub id1_url: Option<String>,

    /// Location of the second entity's director object index.
    #[arg(long = "part-id2-url")]
    pub id2_url: Option<String>,

    /// Fail the run when the first identifier has no index entry,
    /// instead of emitting the resolvable side only.
    #[arg(long = "part-id1-missing-abort")]
    pub id1_missing_abort: bool,

    /// Fail the run when the second identifier has no index entry.
    #[arg(long = "part-id2-missing-abort")]
    pub id2_missing_abort: bool,

    /// The partitioning flags output field name. Appended to the
    /// output field list when not already included.
    #[arg(long = "part-flags", default_value = "partitioningFlags")]
    pub flags_field: String,
}

/// Run the positional partitioner. Returns the merged chunk index,
/// which is also written to `<out-dir>/<prefix>_index.bin`.
pub fn run_pos(args: &PosArgs) -> Result<ChunkIndex> {
    args.common.validate()?;
    std::fs::create_dir_all(&args.common.out_dir).with_context(|| {
        format!("failed to create output directory {}", args.common.out_dir.display())
    })?;
    let (lon, lat) = parse_field_pair("--part-pos", &args.pos)?;
    let object_index = match &args.id_field {
        Some(_) => {
            let url = match &args.id_url {
                Some(url) => url.clone(),
                None => args
                    .common
                    .out_dir
                    .join(format!("{}_object_index.tsv", args.common.prefix))
                    .display()
                    .to_string(),
            };
            Some(Arc::new(ObjectIndexWriter::create(&url)?))
        }
        None => None,
    };
    let config = PosWorkerConfig {
        in_fields: args.common.in_fields.clone(),
        delimiter: args.common.delimiter as u8,
        pos: (lon, lat),
        id_field: args.id_field.clone(),
        chunk_field: args.common.chunk_field.clone(),
        sub_chunk_field: args.common.sub_chunk_field.clone(),
        chunker: args.common.chunker()?,
        out: args.common.output(),
        block_size: args.common.engine_options().block_size(),
        object_index: object_index.clone(),
    };
    let index = run_job(&args.common, || PosWorker::new(&config))?;
    if let Some(writer) = &object_index {
        writer.finish()?;
    }
    Ok(index)
}

/// Run the match-table partitioner. Returns the merged chunk index,
/// which is also written to `<out-dir>/<prefix>_index.bin`.
pub fn run_match(args: &MatchArgs) -> Result<ChunkIndex> {
    args.common.validate()?;
    std::fs::create_dir_all(&args.common.out_dir).with_context(|| {
        format!("failed to create output directory {}", args.common.out_dir.display())
    })?;
    if args.pos1.is_some() != args.pos2.is_some() {
        return Err(anyhow!(
            "both --part-pos1 and --part-pos2 must be specified if either is"
        ));
    }
    if args.id1.is_some() != args.id2.is_some() {
        return Err(anyhow!("both --part-id1 and --part-id2 must be specified if either is"));
    }
    let mode = match (&args.pos1, &args.id1) {
        (Some(_), Some(_)) => {
            return Err(anyhow!(
                "--part-pos1/--part-pos2 and --part-id1/--part-id2 are mutually exclusive"
            ));
        }
        (None, None) => {
            return Err(anyhow!(
                "one of --part-pos1/--part-pos2 or --part-id1/--part-id2 is required"
            ));
        }
        (Some(pos1), None) => MatchMode::Position {
            pos1: parse_field_pair("--part-pos1", pos1)?,
            pos2: parse_field_pair("--part-pos2", args.pos2.as_deref().unwrap_or_default())?,
        },
        (None, Some(id1)) => {
            let id1_url =
                args.id1_url.as_ref().ok_or_else(|| anyhow!("--part-id1-url is required"))?;
            let id2_url =
                args.id2_url.as_ref().ok_or_else(|| anyhow!("--part-id2-url is required"))?;
            MatchMode::Id {
                id1: id1.clone(),
                id2: args.id2.clone().unwrap_or_default(),
                index1: Arc::new(ObjectIndexReader::open(id1_url)?),
                index2: Arc::new(ObjectIndexReader::open(id2_url)?),
                abort_on_missing1: args.id1_missing_abort,
                abort_on_missing2: args.id2_missing_abort,
            }
        }
    };
    let config = MatchWorkerConfig {
        in_fields: args.common.in_fields.clone(),
        delimiter: args.common.delimiter as u8,
        mode,
        chunk_field: args.common.chunk_field.clone(),
        sub_chunk_field: args.common.sub_chunk_field.clone(),
        flags_field: args.flags_field.clone(),
        chunker: args.common.chunker()?,
        out: args.common.output(),
        block_size: args.common.engine_options().block_size(),
    };
    run_job(&args.common, || MatchWorker::new(&config))
}

fn run_job<W, F>(common: &CommonArgs, factory: F) -> Result<ChunkIndex>
where
    W: crate::mapreduce::Worker<Output = ChunkIndex>,
    F: Fn() -> Result<W> + Sync,
{
    let options = common.engine_options();
    let job = Job::new(&options)?;
    let input = InputLines::new(common.input.clone(), options.block_size());
    tracing::info!(
        files = common.input.len(),
        workers = options.num_workers,
        "starting partitioning job"
    );
    let index = job.run(&input, factory)?.unwrap_or_default();
    if !index.is_empty() {
        let path = common.out_dir.join(format!("{}_index.bin", common.prefix));
        index.write(&path, false)?;
        tracing::info!(chunks = index.len(), index = %path.display(), "partitioning complete");
    } else {
        tracing::warn!("no records were partitioned");
    }
    Ok(index)
}
