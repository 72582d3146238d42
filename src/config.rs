//! Scan configuration: validation, normalization, and the config hash.
//!
//! Two configurations that mean the same scan must hash the same so
//! resume and baseline matching work across cosmetic differences: folder
//! order, extension casing or dot prefixes, pattern whitespace and order.
//! Normalization happens once here; the hash covers only the normalized
//! projection, excluding options that do not affect which duplicates are
//! found (worker counts, strictness, incremental settings).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;

use crate::scanner::filter::normalize_extension;
use crate::scanner::walker::absolutize;
use crate::scanner::FileFilter;

/// How duplicate equivalence is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Whole-file content equality (size + full hash).
    #[default]
    Content,
    /// Content equality further split by lowercased filename.
    ContentAndName,
    /// Lowercased filename only; the hash pipeline is bypassed.
    NameOnly,
}

/// Errors raised by configuration validation. A run is refused before any
/// filesystem work when validation fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No scan roots were provided.
    #[error("At least one scan root is required")]
    NoRoots,

    /// Similarity must lie in (0.0, 1.0].
    #[error("Similarity must be in (0.0, 1.0], got {0}")]
    InvalidSimilarity(f64),

    /// The worker pool cannot be empty.
    #[error("max_workers must be at least 1")]
    NoWorkers,

    /// An include or exclude glob failed to compile.
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern text
        pattern: String,
        /// The underlying compile error
        #[source]
        source: glob::PatternError,
    },

    /// The baseline session id is not a valid session reference.
    #[error("Invalid baseline session id: {0}")]
    InvalidBaseline(String),
}

fn default_true() -> bool {
    true
}

fn default_similarity() -> f64 {
    0.9
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

fn default_retention_days() -> u32 {
    30
}

fn default_keep_sessions() -> u32 {
    20
}

/// Configuration for one scan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Ordered list of scan roots.
    pub roots: Vec<PathBuf>,

    /// Minimum candidate size in bytes.
    #[serde(default)]
    pub min_size: u64,

    /// Extension allow-list (empty = all); normalized before use.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// fnmatch-style include globs (empty = all).
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// fnmatch-style exclude globs.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Guard OS system directories.
    #[serde(default = "default_true")]
    pub protect_system: bool,

    /// Follow symbolic links during traversal.
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Drop hidden and OS-metadata files.
    #[serde(default)]
    pub skip_hidden: bool,

    /// Duplicate equivalence mode.
    #[serde(default)]
    pub mode: ScanMode,

    /// Byte-exact verification of content groups.
    #[serde(default)]
    pub byte_verify: bool,

    /// Also run the similar-image stage alongside the content pipeline.
    #[serde(default)]
    pub mixed_mode: bool,

    /// Detect whole-folder duplicates.
    #[serde(default)]
    pub detect_folder_dup: bool,

    /// Include descendant files in folder manifests instead of direct
    /// children only.
    #[serde(default)]
    pub folder_dup_recursive: bool,

    /// Run perceptual image grouping.
    #[serde(default)]
    pub similar_image: bool,

    /// Similarity threshold in (0.0, 1.0]; 1.0 means exact pHash match.
    #[serde(default = "default_similarity")]
    pub similarity: f64,

    /// Reuse a completed baseline session to classify files.
    #[serde(default)]
    pub incremental_rescan: bool,

    /// Baseline session id for incremental classification.
    #[serde(default)]
    pub baseline_session: Option<String>,

    /// Demote the scan to partial when errors exceed the threshold.
    #[serde(default)]
    pub strict_mode: bool,

    /// Maximum tolerated per-file errors in strict mode.
    #[serde(default)]
    pub strict_max_errors: u64,

    /// Upper bound on hash worker threads.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Fingerprint rows unseen for this many days are purged at startup.
    #[serde(default = "default_retention_days")]
    pub cache_retention_days: u32,

    /// Sessions beyond this count are garbage-collected at startup.
    #[serde(default = "default_keep_sessions")]
    pub keep_sessions: u32,
}

impl ScanConfig {
    /// Create a configuration with defaults for everything but the roots.
    #[must_use]
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            min_size: 0,
            extensions: Vec::new(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            protect_system: true,
            follow_symlinks: false,
            skip_hidden: false,
            mode: ScanMode::Content,
            byte_verify: false,
            mixed_mode: false,
            detect_folder_dup: false,
            folder_dup_recursive: false,
            similar_image: false,
            similarity: default_similarity(),
            incremental_rescan: false,
            baseline_session: None,
            strict_mode: false,
            strict_max_errors: 0,
            max_workers: default_max_workers(),
            cache_retention_days: default_retention_days(),
            keep_sessions: default_keep_sessions(),
        }
    }

    /// Validate the configuration before a run starts.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }
        if self.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !(self.similarity > 0.0 && self.similarity <= 1.0) {
            return Err(ConfigError::InvalidSimilarity(self.similarity));
        }
        for pattern in self.include_patterns.iter().chain(&self.exclude_patterns) {
            let trimmed = pattern.trim();
            if trimmed.is_empty() {
                continue;
            }
            glob::Pattern::new(trimmed).map_err(|source| ConfigError::InvalidPattern {
                pattern: trimmed.to_string(),
                source,
            })?;
        }
        if let Some(baseline) = &self.baseline_session {
            if baseline.parse::<i64>().map(|id| id <= 0).unwrap_or(true) {
                return Err(ConfigError::InvalidBaseline(baseline.clone()));
            }
        }
        Ok(())
    }

    /// Compile the candidate filter for this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] on a bad glob; `validate`
    /// reports the same failure earlier with the offending text.
    pub fn build_filter(&self) -> Result<FileFilter, ConfigError> {
        FileFilter::compile(
            self.min_size,
            &self.extensions,
            &self.include_patterns,
            &self.exclude_patterns,
            self.skip_hidden,
        )
        .map_err(|source| ConfigError::InvalidPattern {
            pattern: String::new(),
            source,
        })
    }

    /// Effective worker-pool size: `min(cpu_count, max_workers)`.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        default_max_workers().min(self.max_workers).max(1)
    }

    /// Parsed baseline session id, when configured.
    #[must_use]
    pub fn baseline_id(&self) -> Option<i64> {
        self.baseline_session
            .as_deref()
            .and_then(|s| s.parse().ok())
            .filter(|id| *id > 0)
    }

    /// The normalized projection of this configuration.
    ///
    /// Roots are absolutized and sorted, extensions canonicalized and
    /// sorted, patterns trimmed and sorted. Options that do not change
    /// which duplicates exist are left out.
    #[must_use]
    pub fn normalized(&self) -> NormalizedConfig {
        let mut roots: Vec<String> = self
            .roots
            .iter()
            .map(|r| normalize_path_string(&absolutize(r)))
            .collect();
        roots.sort();
        roots.dedup();

        let mut extensions: Vec<String> = self
            .extensions
            .iter()
            .flat_map(|raw| raw.split(','))
            .map(normalize_extension)
            .filter(|e| !e.is_empty())
            .collect();
        extensions.sort();
        extensions.dedup();

        NormalizedConfig {
            roots,
            min_size: self.min_size,
            extensions,
            include_patterns: normalize_patterns(&self.include_patterns),
            exclude_patterns: normalize_patterns(&self.exclude_patterns),
            protect_system: self.protect_system,
            follow_symlinks: self.follow_symlinks,
            skip_hidden: self.skip_hidden,
            mode: self.mode,
            byte_verify: self.byte_verify,
            detect_folder_dup: self.detect_folder_dup,
            folder_dup_recursive: self.folder_dup_recursive,
            similar_image: self.similar_image,
            similarity: self.similarity,
        }
    }

    /// Canonical JSON of the normalized projection (keys sorted).
    #[must_use]
    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self.normalized()).unwrap_or_default();
        serde_json::to_string(&value).unwrap_or_default()
    }

    /// SHA-256 hex digest of the canonical JSON.
    #[must_use]
    pub fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Normalized projection fed into the config hash.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NormalizedConfig {
    /// Absolutized, sorted, deduplicated roots.
    pub roots: Vec<String>,
    /// Minimum candidate size in bytes.
    pub min_size: u64,
    /// Canonical extension tokens, sorted.
    pub extensions: Vec<String>,
    /// Trimmed, sorted include globs.
    pub include_patterns: Vec<String>,
    /// Trimmed, sorted exclude globs.
    pub exclude_patterns: Vec<String>,
    /// System-directory guarding.
    pub protect_system: bool,
    /// Symlink traversal.
    pub follow_symlinks: bool,
    /// Hidden-file skipping.
    pub skip_hidden: bool,
    /// Equivalence mode.
    pub mode: ScanMode,
    /// Byte-exact verification.
    pub byte_verify: bool,
    /// Folder-duplicate detection.
    pub detect_folder_dup: bool,
    /// Folder-manifest depth.
    pub folder_dup_recursive: bool,
    /// Perceptual grouping.
    pub similar_image: bool,
    /// Similarity threshold.
    pub similarity: f64,
}

fn normalize_patterns(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = raw
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Render a path with a trailing `/.` or lone `.` component removed and
/// separators unified, so `"/a/b/."` and `"/a/b"` normalize identically.
fn normalize_path_string(path: &std::path::Path) -> String {
    use std::path::Component;
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned.to_string_lossy().replace('\\', "/")
}
