use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "anno-cache")]
#[command(about = "Scan Java containers for annotation targets and cache the results on disk")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Cache directory (default: $ANNO_CACHE_DIR, then the local data dir).
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long)]
    pub read_only: bool,

    /// Trust stored stamps without re-stamping containers.
    #[arg(long)]
    pub always_valid: bool,

    #[arg(long, value_name = "N")]
    pub write_threads: Option<usize>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Scan every container under PATH, serving unchanged ones from the cache.
    Scan {
        path: PathBuf,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Stamp by content hash instead of size and mtime.
        #[arg(long)]
        content_stamp: bool,
    },
    /// Print the cached tables of one container.
    Show {
        container: PathBuf,

        #[arg(long)]
        content_stamp: bool,
    },
    /// Decode a single table file.
    Dump { file: PathBuf },
    /// Move names that are now visible from unresolved to resolved.
    Retry {
        container: PathBuf,

        #[arg(long = "resolved", value_name = "CLASS", required = true)]
        resolved: Vec<String>,

        #[arg(long)]
        content_stamp: bool,
    },
    Invalidate { container: PathBuf },
    List,
    Stats,
    Clear,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}
