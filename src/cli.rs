//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::{ScanConfig, ScanMode};

/// Staged duplicate-file scanner with a persistent fingerprint cache
/// and resumable sessions.
#[derive(Debug, Parser)]
#[command(name = "dupescan", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors and suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Override the database location (defaults to the app-data dir)
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan one or more roots for duplicates
    Scan(Box<ScanArgs>),
    /// Load and summarize a previously exported result file
    Load(LoadArgs),
}

/// Equivalence mode flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ModeArg {
    /// Whole-file content equality
    #[default]
    Content,
    /// Content equality split by filename
    ContentAndName,
    /// Filename only, no hashing
    NameOnly,
}

impl From<ModeArg> for ScanMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Content => ScanMode::Content,
            ModeArg::ContentAndName => ScanMode::ContentAndName,
            ModeArg::NameOnly => ScanMode::NameOnly,
        }
    }
}

/// Arguments for the `scan` subcommand.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Roots to scan
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Minimum file size in bytes
    #[arg(long, default_value_t = 0)]
    pub min_size: u64,

    /// Only consider these extensions (comma-separated, dot optional)
    #[arg(long, value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// Only include files matching these glob patterns
    #[arg(long = "include")]
    pub include_patterns: Vec<String>,

    /// Exclude files matching these glob patterns
    #[arg(long = "exclude")]
    pub exclude_patterns: Vec<String>,

    /// Descend into symlinked directories
    #[arg(long)]
    pub follow_symlinks: bool,

    /// Skip hidden files and OS metadata entries
    #[arg(long)]
    pub skip_hidden: bool,

    /// Disable the protected system-directory guard
    #[arg(long)]
    pub no_protect_system: bool,

    /// Duplicate equivalence mode
    #[arg(long, value_enum, default_value = "content")]
    pub mode: ModeArg,

    /// Verify candidate groups byte-by-byte
    #[arg(long)]
    pub byte_verify: bool,

    /// Detect whole-folder duplicates
    #[arg(long)]
    pub folder_dups: bool,

    /// Compare folders as whole subtrees instead of direct children
    #[arg(long, requires = "folder_dups")]
    pub folder_dups_recursive: bool,

    /// Group visually similar images
    #[arg(long)]
    pub similar_images: bool,

    /// Similarity threshold in (0.0, 1.0]
    #[arg(long, default_value_t = 0.9)]
    pub similarity: f64,

    /// Run the similar-image stage alongside the content pipeline
    #[arg(long, requires = "similar_images")]
    pub mixed_mode: bool,

    /// Classify files against a completed baseline session
    #[arg(long)]
    pub incremental: bool,

    /// Baseline session id for incremental classification
    #[arg(long, requires = "incremental")]
    pub baseline: Option<String>,

    /// Demote the scan to partial when errors exceed the threshold
    #[arg(long)]
    pub strict_mode: bool,

    /// Maximum tolerated per-file errors in strict mode
    #[arg(long, default_value_t = 0, requires = "strict_mode")]
    pub strict_max_errors: u64,

    /// Upper bound on hash worker threads
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Write the result document to this file
    #[arg(long)]
    pub output_json: Option<PathBuf>,
}

impl ScanArgs {
    /// Build the core configuration from the parsed arguments.
    #[must_use]
    pub fn to_config(&self) -> ScanConfig {
        let mut config = ScanConfig::new(self.paths.clone());
        config.min_size = self.min_size;
        config.extensions = self.extensions.clone();
        config.include_patterns = self.include_patterns.clone();
        config.exclude_patterns = self.exclude_patterns.clone();
        config.protect_system = !self.no_protect_system;
        config.follow_symlinks = self.follow_symlinks;
        config.skip_hidden = self.skip_hidden;
        config.mode = self.mode.into();
        config.byte_verify = self.byte_verify;
        config.detect_folder_dup = self.folder_dups;
        config.folder_dup_recursive = self.folder_dups_recursive;
        config.similar_image = self.similar_images;
        config.similarity = self.similarity;
        config.mixed_mode = self.mixed_mode;
        config.incremental_rescan = self.incremental;
        config.baseline_session = self.baseline.clone();
        config.strict_mode = self.strict_mode;
        config.strict_max_errors = self.strict_max_errors;
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }
        config
    }
}

/// Arguments for the `load` subcommand.
#[derive(Debug, Args)]
pub struct LoadArgs {
    /// Path to a result document (v2 or legacy shape)
    pub input: PathBuf,
}
