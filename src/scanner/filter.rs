//! Candidate filtering: size, extension, include/exclude patterns, hidden files.
//!
//! Four gates are applied to each candidate, in order: minimum size,
//! extension allow-list (empty = all), include patterns (empty = all),
//! exclude patterns. A separate predicate drops hidden and OS-metadata
//! files when requested. Extensions are canonicalized once at
//! configuration time and patterns are compiled once per scan.

use std::collections::BTreeSet;
use std::path::Path;

use glob::{MatchOptions, Pattern, PatternError};

/// Names treated as OS metadata in addition to dot-prefixed entries.
const SYSTEM_NAMES: [&str; 3] = ["thumbs.db", "desktop.ini", ".ds_store"];

/// Canonicalize an extension token: trim, lowercase, strip the leading dot.
///
/// `.TXT`, `TXT`, `.txt` and `txt` all map to `txt`.
#[must_use]
pub fn normalize_extension(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Whether a file name is hidden or a known OS-metadata entry.
#[must_use]
pub fn is_hidden_or_system(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    if name.starts_with('.') {
        return true;
    }
    SYSTEM_NAMES.contains(&name.to_ascii_lowercase().as_str())
}

/// Compiled per-scan filter.
#[derive(Debug, Clone)]
pub struct FileFilter {
    min_size: u64,
    extensions: BTreeSet<String>,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    skip_hidden: bool,
}

impl FileFilter {
    /// Compile a filter from raw configuration values.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`PatternError`] when an include or exclude
    /// glob fails to compile.
    pub fn compile(
        min_size: u64,
        extensions: &[String],
        include_patterns: &[String],
        exclude_patterns: &[String],
        skip_hidden: bool,
    ) -> Result<Self, PatternError> {
        let extensions = extensions
            .iter()
            .map(|e| normalize_extension(e))
            .filter(|e| !e.is_empty())
            .collect();

        Ok(Self {
            min_size,
            extensions,
            include: compile_patterns(include_patterns)?,
            exclude: compile_patterns(exclude_patterns)?,
            skip_hidden,
        })
    }

    /// Whether hidden-file skipping is enabled.
    #[must_use]
    pub fn skip_hidden(&self) -> bool {
        self.skip_hidden
    }

    /// Whether a size passes the minimum-size gate. Zero-byte files are
    /// always rejected; they all hash identically.
    #[must_use]
    pub fn accepts_size(&self, size: u64) -> bool {
        size > 0 && size >= self.min_size
    }

    /// Whether a name should be dropped by the hidden/system predicate.
    #[must_use]
    pub fn rejects_name(&self, name: &str) -> bool {
        self.skip_hidden && is_hidden_or_system(name)
    }

    /// Whether the extension gate accepts this path.
    #[must_use]
    pub fn accepts_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        self.extensions.contains(&ext)
    }

    /// Whether the include gate accepts this path (empty list = all).
    #[must_use]
    pub fn accepts_include(&self, path: &Path) -> bool {
        if self.include.is_empty() {
            return true;
        }
        matches_any(&self.include, path)
    }

    /// Whether the exclude gate rejects this path.
    #[must_use]
    pub fn rejects_exclude(&self, path: &Path) -> bool {
        !self.exclude.is_empty() && matches_any(&self.exclude, path)
    }

    /// Apply every gate to a candidate file, in order.
    #[must_use]
    pub fn accepts_file(&self, path: &Path, size: u64) -> bool {
        if !self.accepts_size(size) {
            return false;
        }
        if !self.accepts_extension(path) {
            return false;
        }
        if !self.accepts_include(path) {
            return false;
        }
        !self.rejects_exclude(path)
    }
}

fn compile_patterns(raw: &[String]) -> Result<Vec<Pattern>, PatternError> {
    raw.iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(Pattern::new)
        .collect()
}

/// Match against both the file name and the normalized full path, so a
/// pattern like `*.tmp` and one like `*/build/*` both behave as expected.
fn matches_any(patterns: &[Pattern], path: &Path) -> bool {
    let options = MatchOptions {
        case_sensitive: !cfg!(windows),
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    let full = path.to_string_lossy().replace('\\', "/");

    patterns
        .iter()
        .any(|p| p.matches_with(&name, options) || p.matches_with(&full, options))
}
