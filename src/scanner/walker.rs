//! Directory walker: single-threaded recursive enumeration.
//!
//! # Overview
//!
//! The walker enumerates each configured root with one stat per entry and
//! yields [`FileRecord`] values for candidates that pass the compiled
//! [`FileFilter`]. Enumeration runs on one thread; downstream hashing
//! consumes the collected records through a bounded queue.
//!
//! # Behavior
//!
//! - Symbolic links are not followed unless configured; when followed,
//!   directory cycles are broken by tracking the `(device, inode)` of
//!   every visited directory and refusing to re-enter.
//! - Protected system directories are matched by path component, so a
//!   sibling whose name merely extends a protected one is not caught.
//! - Hardlinked paths collapse at collection: the first path seen for a
//!   `(device, inode)` wins.
//! - Per-entry I/O errors are counted and sampled into the log; they never
//!   abort the walk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::filter::is_hidden_or_system;
use super::{inode_ids, FileFilter, FileRecord};

/// How many failing paths are logged at warn level before sampling stops.
const ERROR_SAMPLE_LIMIT: u64 = 5;

/// Result of a collection pass over all roots.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Candidate files that passed every filter gate.
    pub files: Vec<FileRecord>,
    /// Count of per-entry I/O failures encountered and skipped.
    pub errors: u64,
    /// Operator-facing warnings (protected roots, missing roots).
    pub warnings: Vec<String>,
    /// Whether the walk stopped early due to cancellation.
    pub cancelled: bool,
}

/// Single-threaded recursive directory walker.
#[derive(Debug)]
pub struct Walker {
    roots: Vec<PathBuf>,
    filter: FileFilter,
    follow_symlinks: bool,
    protected: Vec<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl Walker {
    /// Create a walker over the given roots.
    ///
    /// # Arguments
    ///
    /// * `roots` - Directories to enumerate
    /// * `filter` - Compiled candidate filter
    /// * `follow_symlinks` - Descend into symlinked directories
    /// * `protect_system` - Guard OS system directories
    #[must_use]
    pub fn new(
        roots: Vec<PathBuf>,
        filter: FileFilter,
        follow_symlinks: bool,
        protect_system: bool,
    ) -> Self {
        let protected = if protect_system {
            default_protected_paths()
        } else {
            Vec::new()
        };
        Self {
            roots,
            filter,
            follow_symlinks,
            protected,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the protected-path set. Used by tests and by callers with
    /// their own notion of off-limits directories.
    #[must_use]
    pub fn with_protected_paths(mut self, protected: Vec<PathBuf>) -> Self {
        self.protected = protected;
        self
    }

    /// Share a cancel flag; the walk stops at the next entry once set.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Whether a path lies under a protected directory.
    ///
    /// Comparison is component-wise (`Path::starts_with`), so
    /// `/usrlocal` does not match a protected `/usr`.
    #[must_use]
    pub fn is_protected(&self, path: &Path) -> bool {
        self.protected.iter().any(|p| path.starts_with(p))
    }

    /// Enumerate every root and collect candidate records.
    #[must_use]
    pub fn collect(&self) -> WalkOutcome {
        let mut out = WalkOutcome::default();
        let mut seen_dirs: HashSet<(u64, u64)> = HashSet::new();
        let mut seen_inodes: HashSet<(u64, u64)> = HashSet::new();

        for root in &self.roots {
            if self.is_cancelled() {
                out.cancelled = true;
                break;
            }

            let root = absolutize(root);

            if self.is_protected(&root) {
                log::warn!("Skipping protected root: {}", root.display());
                out.warnings
                    .push(format!("protected_root_skipped:{}", root.display()));
                continue;
            }

            if !root.is_dir() {
                log::warn!("Scan root is not a directory: {}", root.display());
                out.warnings
                    .push(format!("root_unavailable:{}", root.display()));
                continue;
            }

            if self.follow_symlinks {
                if let Some(key) = dir_key(&root) {
                    if !seen_dirs.insert(key) {
                        continue;
                    }
                }
            }

            self.walk_dir(&root, &mut seen_dirs, &mut seen_inodes, &mut out);
        }

        if self.is_cancelled() {
            out.cancelled = true;
        }
        out
    }

    fn walk_dir(
        &self,
        dir: &Path,
        seen_dirs: &mut HashSet<(u64, u64)>,
        seen_inodes: &mut HashSet<(u64, u64)>,
        out: &mut WalkOutcome,
    ) {
        let entries = match std::fs::read_dir(dir) {
            Ok(iter) => iter,
            Err(e) => {
                self.record_error(out, dir, &e);
                return;
            }
        };

        // Sort children for deterministic output across runs.
        let mut entries: Vec<_> = entries.collect();
        entries.sort_by(|a, b| match (a, b) {
            (Ok(a), Ok(b)) => a.file_name().cmp(&b.file_name()),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => std::cmp::Ordering::Equal,
        });

        for entry in entries {
            if self.is_cancelled() {
                out.cancelled = true;
                return;
            }

            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    self.record_error(out, dir, &e);
                    continue;
                }
            };

            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if self.filter.skip_hidden() && is_hidden_or_system(&name) {
                log::trace!("Skipping hidden entry: {}", path.display());
                continue;
            }

            if self.filter.rejects_exclude(&path) {
                log::trace!("Excluded by pattern: {}", path.display());
                continue;
            }

            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    self.record_error(out, &path, &e);
                    continue;
                }
            };

            let is_symlink = file_type.is_symlink();
            if is_symlink && !self.follow_symlinks {
                log::trace!("Skipping symlink: {}", path.display());
                continue;
            }

            let metadata = if self.follow_symlinks {
                std::fs::metadata(&path)
            } else {
                std::fs::symlink_metadata(&path)
            };
            let metadata = match metadata {
                Ok(m) => m,
                Err(e) => {
                    self.record_error(out, &path, &e);
                    continue;
                }
            };

            if metadata.is_dir() {
                if self.is_protected(&path) {
                    log::debug!("Skipping protected directory: {}", path.display());
                    continue;
                }
                if self.follow_symlinks {
                    if let Some(key) = dir_key(&path) {
                        if !seen_dirs.insert(key) {
                            log::debug!("Directory cycle detected at {}", path.display());
                            continue;
                        }
                    }
                }
                self.walk_dir(&path, seen_dirs, seen_inodes, out);
                continue;
            }

            if !metadata.is_file() {
                continue;
            }

            if !self.filter.accepts_extension(&path) || !self.filter.accepts_include(&path) {
                continue;
            }

            if !self.filter.accepts_size(metadata.len()) {
                log::trace!(
                    "Skipping file due to size filter ({}): {}",
                    metadata.len(),
                    path.display()
                );
                continue;
            }

            let (dev, ino) = inode_ids(&metadata);
            if ino != 0 && !seen_inodes.insert((dev, ino)) {
                log::debug!("Skipping hardlink: {}", path.display());
                continue;
            }

            out.files.push(FileRecord::from_metadata(path, &metadata));
        }
    }

    fn record_error(&self, out: &mut WalkOutcome, path: &Path, error: &std::io::Error) {
        out.errors += 1;
        if out.errors <= ERROR_SAMPLE_LIMIT {
            log::warn!("Walk error for {}: {}", path.display(), error);
        } else {
            log::debug!("Walk error for {}: {}", path.display(), error);
        }
    }
}

/// Stable identity for a directory, used for cycle detection.
fn dir_key(path: &Path) -> Option<(u64, u64)> {
    let metadata = std::fs::metadata(path).ok()?;
    let (dev, ino) = inode_ids(&metadata);
    if ino == 0 {
        None
    } else {
        Some((dev, ino))
    }
}

/// Make a path absolute without resolving symlinks.
pub(crate) fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Platform set of protected system directories.
#[must_use]
pub fn default_protected_paths() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        let sys_drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
        let mut out: Vec<PathBuf> = ["WINDIR", "SystemRoot", "ProgramFiles", "ProgramFiles(x86)", "ProgramData"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(PathBuf::from)
            .collect();
        for fallback in ["Windows", "Program Files", "Program Files (x86)", "ProgramData"] {
            out.push(PathBuf::from(format!("{sys_drive}\\{fallback}")));
        }
        out.sort();
        out.dedup();
        out
    }
    #[cfg(not(windows))]
    {
        [
            "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/run", "/sbin",
            "/sys", "/usr", "/var",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }
}
