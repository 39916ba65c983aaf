//! Skymap bulk partitioner CLI (skypart)

use anyhow::Result;
use clap::{Parser, Subcommand};
use skypart::chunk_index::ChunkIndex;
use skypart::config::{run_match, run_pos, MatchArgs, PosArgs};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "skypart")]
#[command(about = "Partition catalog CSV files for loading by database worker nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition a positional table.
    ///
    /// Each input row is assigned a location in the two-level
    /// subdivision, duplicated into the overlap regions of neighboring
    /// sub-chunks, and bucket-sorted by chunk ID into per-chunk files
    /// that worker nodes load directly. A partitioned data set can be
    /// built up incrementally by running the partitioner with disjoint
    /// input file sets and the same output directory; the output
    /// format, partitioning parameters and node count must be
    /// identical between runs, and only one partitioner process may
    /// write to an output directory at a time.
    Pos(PosArgs),
    /// Partition a match table.
    ///
    /// Both positions in a match pair are assigned a location, and the
    /// pair is output once for each distinct location, flagged with
    /// which side matched.
    #[command(name = "match")]
    Matches(MatchArgs),
    /// Print a JSON summary of one or more merged chunk index files.
    IndexStats {
        /// Chunk index files; several are merged before reporting.
        files: Vec<PathBuf>,
        /// 0 adds per-chunk counts, above 0 per-sub-chunk counts as
        /// well; negative prints statistics only.
        #[arg(long, default_value_t = 0)]
        verbosity: i32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skypart=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Pos(args) => {
            let mut index = run_pos(&args)?;
            print_summary(&mut index, 0)?;
        }
        Commands::Matches(args) => {
            let mut index = run_match(&args)?;
            print_summary(&mut index, 0)?;
        }
        Commands::IndexStats { files, verbosity } => {
            let mut index = ChunkIndex::from_paths(&files)?;
            print_summary(&mut index, verbosity)?;
        }
    }
    Ok(())
}

fn print_summary(index: &mut ChunkIndex, verbosity: i32) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&index.summary(verbosity))?);
    Ok(())
}
