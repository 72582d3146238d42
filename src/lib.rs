//! dupescan - staged duplicate-file scanner core.
//!
//! Finds duplicate files across one or more roots through a staged
//! pipeline: walk → filter → quick hash → full hash → group, with
//! optional folder-duplicate and perceptual-image stages. All
//! intermediate state persists to a SQLite store so interrupted runs
//! resume without redoing completed work.

pub mod cli;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod logging;
pub mod output;
pub mod progress;
pub mod scanner;
pub mod signal;
pub mod store;

pub use config::{ConfigError, ScanConfig, ScanMode};
pub use duplicates::{DuplicateFinder, GroupKey, ScanCompletion, ScanReport};
pub use store::Store;
