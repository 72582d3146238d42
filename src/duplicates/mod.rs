//! Duplicate detection: group keys, telemetry, and the staged pipeline.
//!
//! # Architecture
//!
//! - [`groups`]: size grouping, inode dedup, byte verification, name modes
//! - [`pipeline`]: bounded parallel hashing with cache lookups
//! - [`folders`]: directory-manifest duplicate detection
//! - [`similar`]: perceptual image grouping stage
//! - [`finder`]: the orchestrator driving all stages

pub mod finder;
pub mod folders;
pub mod groups;
pub mod pipeline;
pub mod similar;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::scanner::HashError;

pub use finder::{DuplicateFinder, ScanCompletion, ScanReport};

/// Warning recorded when strict mode demotes a scan.
pub const WARNING_STRICT_THRESHOLD: &str = "strict_mode_threshold_exceeded";

/// Equivalence-class key for a duplicate group.
///
/// Four variants cover every grouping the pipeline can emit; export and
/// render boundaries match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// Whole-file content equality.
    Content {
        /// Shared file size in bytes.
        size: u64,
        /// Full-hash hex (possibly suffixed when byte verification
        /// splits a hash group).
        hash: String,
    },
    /// Lowercased-filename equality.
    NameOnly {
        /// The shared lowercased name.
        name: String,
    },
    /// Perceptual similarity cluster.
    SimilarImage {
        /// Cluster index within the session.
        cluster: u64,
        /// Size of the representative member in bytes.
        size: u64,
    },
    /// Whole-folder manifest equality.
    FolderDup {
        /// Manifest hash hex.
        manifest: String,
    },
}

impl GroupKey {
    /// Encode as the stable `<tag>:<payload>` string used in exports and
    /// the session store.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Content { hash, .. } => format!("content:{hash}"),
            Self::NameOnly { name } => format!("name:{name}"),
            Self::SimilarImage { cluster, .. } => format!("similar:{cluster}"),
            Self::FolderDup { manifest } => format!("folder:{manifest}"),
        }
    }

    /// Parse an encoded key. Sizes are not part of the encoding and come
    /// back as zero.
    #[must_use]
    pub fn parse(encoded: &str) -> Option<Self> {
        let (tag, payload) = encoded.split_once(':')?;
        match tag {
            "content" if !payload.is_empty() => Some(Self::Content {
                size: 0,
                hash: payload.to_string(),
            }),
            "name" if !payload.is_empty() => Some(Self::NameOnly {
                name: payload.to_string(),
            }),
            "similar" => payload
                .parse()
                .ok()
                .map(|cluster| Self::SimilarImage { cluster, size: 0 }),
            "folder" if !payload.is_empty() => Some(Self::FolderDup {
                manifest: payload.to_string(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// How many failing paths are logged per error class before sampling
/// falls back to debug level.
const ERROR_SAMPLE_LIMIT: u64 = 5;

/// Thread-safe telemetry counters for one scan.
///
/// Per-file faults never propagate out of worker tasks; they surface
/// only through these counters and capped log samples.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    files_scanned: AtomicU64,
    files_hashed: AtomicU64,
    files_skipped_error: AtomicU64,
    files_skipped_locked: AtomicU64,
    errors_total: AtomicU64,
    sampled: AtomicU64,
}

impl ScanMetrics {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to the scanned-file count.
    pub fn add_scanned(&self, n: u64) {
        self.files_scanned.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one successfully hashed file.
    pub fn record_hashed(&self) {
        self.files_hashed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add walker-side I/O failures.
    pub fn add_walk_errors(&self, n: u64) {
        self.files_skipped_error.fetch_add(n, Ordering::Relaxed);
        self.errors_total.fetch_add(n, Ordering::Relaxed);
    }

    /// Classify and record a per-file hashing fault.
    ///
    /// Cancellation is not a fault and is ignored here.
    pub fn record_hash_error(&self, error: &HashError) {
        match error {
            HashError::Interrupted(_) => return,
            HashError::Locked(_) => {
                self.files_skipped_locked.fetch_add(1, Ordering::Relaxed);
            }
            HashError::NotFound(_) | HashError::PermissionDenied(_) | HashError::Io { .. } => {
                self.files_skipped_error.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.errors_total.fetch_add(1, Ordering::Relaxed);

        let sampled = self.sampled.fetch_add(1, Ordering::Relaxed);
        if sampled < ERROR_SAMPLE_LIMIT {
            log::warn!("Hash task skipped: {error}");
        } else {
            log::debug!("Hash task skipped: {error}");
        }
    }

    /// Record a non-content per-file fault (e.g. an undecodable image).
    pub fn record_other_error(&self, message: &str) {
        self.files_skipped_error.fetch_add(1, Ordering::Relaxed);
        self.errors_total.fetch_add(1, Ordering::Relaxed);

        let sampled = self.sampled.fetch_add(1, Ordering::Relaxed);
        if sampled < ERROR_SAMPLE_LIMIT {
            log::warn!("File skipped: {message}");
        } else {
            log::debug!("File skipped: {message}");
        }
    }

    /// Current total error count.
    #[must_use]
    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Copy the counters into a serializable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_scanned: self.files_scanned.load(Ordering::Relaxed),
            files_hashed: self.files_hashed.load(Ordering::Relaxed),
            files_skipped_error: self.files_skipped_error.load(Ordering::Relaxed),
            files_skipped_locked: self.files_skipped_locked.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ScanMetrics`] for reports and exports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Files collected by the walker.
    pub files_scanned: u64,
    /// Files successfully hashed (cache hits included).
    pub files_hashed: u64,
    /// Files skipped on missing/permission/io faults.
    pub files_skipped_error: u64,
    /// Files skipped because the OS reported a lock.
    pub files_skipped_locked: u64,
    /// All per-file faults.
    pub errors_total: u64,
}

/// Delta classification of an incremental rescan against its baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalStats {
    /// Files absent from the baseline.
    pub new: u64,
    /// Files whose `(size, mtime)` changed since the baseline.
    pub changed: u64,
    /// Files unchanged since the baseline.
    pub revalidated: u64,
    /// Baseline files no longer on disk.
    pub missing: u64,
    /// The baseline session consulted.
    pub baseline_session: i64,
}
