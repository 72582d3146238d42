//! Result export and import.

pub mod json;

pub use json::{load_results, ExportDocument, ExportMeta, LoadedResults};
