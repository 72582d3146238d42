//! Scanner module: directory traversal, filtering, and content hashing.
//!
//! # Architecture
//!
//! - [`walker`]: single-threaded recursive enumeration with protected-root
//!   guarding and symlink-loop detection
//! - [`filter`]: size/extension/include/exclude/hidden predicates compiled
//!   once per scan
//! - [`hasher`]: BLAKE3-128 partial and full content digests
//! - [`perceptual`]: 64-bit pHash with BK-tree similarity clustering

pub mod filter;
pub mod hasher;
pub mod perceptual;
pub mod walker;

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::PathBuf;
use std::time::SystemTime;

pub use filter::FileFilter;
pub use hasher::{hash_to_hex, hex_to_hash, Hash, PARTIAL_HASH_SIZE, READ_BUFFER_SIZE};
pub use walker::Walker;

/// Metadata for a discovered filesystem entry.
///
/// Produced by the walker after a single stat; immutable thereafter.
/// `mtime` is truncated to whole epoch seconds so fingerprint-cache
/// witness comparisons are stable across platforms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileRecord {
    /// Absolute path to the file
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Modification time in whole seconds since the Unix epoch
    pub mtime: i64,
    /// Device id, 0 when the platform does not expose one
    pub dev: u64,
    /// Inode id, 0 when the platform does not expose one
    pub ino: u64,
}

impl FileRecord {
    /// Create a record from a path and its metadata.
    #[must_use]
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        let mtime = mtime_seconds(metadata);
        let (dev, ino) = inode_ids(metadata);
        Self {
            path,
            size: metadata.len(),
            mtime,
            dev,
            ino,
        }
    }

    /// Physical identity of the file, when the platform exposes one.
    ///
    /// Two records with the same key are hardlinks (or the same path seen
    /// twice) and must collapse to a single group member.
    #[must_use]
    pub fn inode_key(&self) -> Option<(u64, u64)> {
        if self.ino == 0 {
            None
        } else {
            Some((self.dev, self.ino))
        }
    }
}

/// Modification time of a file as whole epoch seconds.
#[must_use]
pub fn mtime_seconds(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_secs()).ok(),
            Err(e) => i64::try_from(e.duration().as_secs()).ok().map(|s| -s),
        })
        .unwrap_or(0)
}

/// Device and inode ids from metadata, `(0, 0)` when unavailable.
#[must_use]
pub fn inode_ids(metadata: &Metadata) -> (u64, u64) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        (metadata.dev(), metadata.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        (0, 0)
    }
}

/// Errors that can occur during directory scanning.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    /// Permission was denied when accessing a file or directory.
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// The specified path was not found.
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    /// The specified path is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// An I/O error occurred while accessing a file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while hashing a file.
#[derive(thiserror::Error, Debug)]
pub enum HashError {
    /// The file was not found (deleted between collection and hashing).
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    /// Permission was denied when reading the file.
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// The OS reported an exclusive lock or sharing violation.
    #[error("File locked: {0}")]
    Locked(PathBuf),

    /// Hashing was interrupted by cancellation.
    #[error("Hashing interrupted: {0}")]
    Interrupted(PathBuf),

    /// An I/O error occurred while reading the file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}
