//! JSON result export (v2) and the tolerant loader.
//!
//! # Output Schema
//!
//! ```json
//! {
//!   "meta": {
//!     "scan_status": "completed",
//!     "metrics": {
//!       "files_scanned": 1200,
//!       "files_hashed": 40,
//!       "files_skipped_error": 0,
//!       "files_skipped_locked": 0,
//!       "errors_total": 0
//!     },
//!     "warnings": [],
//!     "config_hash": "9f...",
//!     "session_id": "17"
//!   },
//!   "results": {
//!     "content:ab12...": ["/data/a.bin", "/data/b.bin"]
//!   }
//! }
//! ```
//!
//! The loader also accepts the legacy shape: a bare object mapping group
//! keys to path lists, with no `meta` envelope.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duplicates::{MetricsSnapshot, ScanReport};

/// Errors from export and import.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Serialization or parse failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload is neither a v2 document nor a legacy result map.
    #[error("Unrecognized results payload shape")]
    InvalidShape,
}

/// The `meta` envelope of a v2 export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMeta {
    /// `completed` or `partial`.
    pub scan_status: String,
    /// Telemetry snapshot of the run.
    pub metrics: MetricsSnapshot,
    /// Free-form warning list (e.g. `strict_mode_threshold_exceeded`).
    pub warnings: Vec<String>,
    /// Config hash of the run.
    pub config_hash: String,
    /// Session id as an opaque string.
    pub session_id: String,
}

/// A complete v2 export document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    /// Run metadata.
    pub meta: ExportMeta,
    /// Encoded group key → member paths.
    pub results: BTreeMap<String, Vec<String>>,
}

impl ExportDocument {
    /// Build an export from a finished scan report.
    #[must_use]
    pub fn from_report(report: &ScanReport) -> Self {
        Self {
            meta: ExportMeta {
                scan_status: report.status.as_str().to_string(),
                metrics: report.metrics.clone(),
                warnings: report.warnings.clone(),
                config_hash: report.config_hash.clone(),
                session_id: report.session.to_string(),
            },
            results: report.results.clone(),
        }
    }

    /// Compact JSON.
    ///
    /// # Errors
    ///
    /// Forwards serialization failures.
    pub fn to_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Forwards serialization failures.
    pub fn to_json_pretty(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the pretty document to a file.
    ///
    /// # Errors
    ///
    /// Forwards serialization and filesystem failures.
    pub fn write_to(&self, path: &Path) -> Result<(), ExportError> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(self.to_json_pretty()?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

/// A parsed results payload, v2 or legacy.
#[derive(Debug, Clone)]
pub struct LoadedResults {
    /// Present for v2 documents, absent for the legacy shape.
    pub meta: Option<ExportMeta>,
    /// Encoded group key → member paths.
    pub results: BTreeMap<String, Vec<String>>,
}

/// Parse a results payload in either supported shape.
///
/// # Errors
///
/// Returns [`ExportError::InvalidShape`] when the payload is neither a
/// v2 document nor a bare group map, or a JSON error on malformed input.
pub fn load_results(payload: &str) -> Result<LoadedResults, ExportError> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    let object = value.as_object().ok_or(ExportError::InvalidShape)?;

    if object.get("results").is_some_and(serde_json::Value::is_object) {
        let document: ExportDocument = serde_json::from_value(value)?;
        return Ok(LoadedResults {
            meta: Some(document.meta),
            results: document.results,
        });
    }

    let mut results = BTreeMap::new();
    for (key, paths) in object {
        let paths = paths.as_array().ok_or(ExportError::InvalidShape)?;
        let mut members = Vec::with_capacity(paths.len());
        for path in paths {
            members.push(
                path.as_str()
                    .ok_or(ExportError::InvalidShape)?
                    .to_string(),
            );
        }
        results.insert(key.clone(), members);
    }
    Ok(LoadedResults {
        meta: None,
        results,
    })
}
