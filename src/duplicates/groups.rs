//! Group building: size partitioning, inode dedup, verification, name modes.
//!
//! Size grouping is the first phase of detection: files with different
//! sizes cannot be byte-identical, so partitioning by exact size
//! eliminates most candidates without touching file contents. The final
//! phase consumes `(size, full_hash)` equivalence classes, collapses
//! hardlinks, optionally verifies byte equality, and emits encoded
//! [`GroupKey`] entries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::AtomicBool;

use super::{GroupKey, ScanMetrics};
use crate::config::ScanMode;
use crate::scanner::{hasher, FileRecord, HashError};

/// Statistics from the size-grouping phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupingStats {
    /// Files considered.
    pub total_files: usize,
    /// Distinct sizes seen.
    pub unique_sizes: usize,
    /// Files surviving in groups of two or more.
    pub potential_duplicates: usize,
    /// Files eliminated as the only holder of their size.
    pub eliminated_unique: usize,
    /// Size groups with two or more files.
    pub duplicate_groups: usize,
}

impl GroupingStats {
    /// Percentage of files eliminated by size grouping alone.
    #[must_use]
    pub fn elimination_rate(&self) -> f64 {
        if self.total_files == 0 {
            0.0
        } else {
            (self.eliminated_unique as f64 / self.total_files as f64) * 100.0
        }
    }
}

/// Partition files by exact size, keeping only groups of two or more.
#[must_use]
pub fn group_by_size(
    files: impl IntoIterator<Item = FileRecord>,
) -> (HashMap<u64, Vec<FileRecord>>, GroupingStats) {
    let mut all_groups: HashMap<u64, Vec<FileRecord>> = HashMap::new();
    let mut stats = GroupingStats::default();

    for file in files {
        stats.total_files += 1;
        all_groups.entry(file.size).or_default().push(file);
    }

    stats.unique_sizes = all_groups.len();

    let filtered: HashMap<u64, Vec<FileRecord>> = all_groups
        .into_iter()
        .filter(|(_, members)| {
            if members.len() == 1 {
                stats.eliminated_unique += 1;
                false
            } else {
                stats.potential_duplicates += members.len();
                stats.duplicate_groups += 1;
                true
            }
        })
        .collect();

    log::info!(
        "Size grouping: {} files, {} potential duplicates ({:.1}% eliminated)",
        stats.total_files,
        stats.potential_duplicates,
        stats.elimination_rate()
    );

    (filtered, stats)
}

/// Collapse hardlinks: keep the first member per `(device, inode)`.
///
/// Members without inode information are kept as-is.
#[must_use]
pub fn dedup_inodes(members: Vec<FileRecord>) -> Vec<FileRecord> {
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    members
        .into_iter()
        .filter(|member| match member.inode_key() {
            Some(key) => seen.insert(key),
            None => true,
        })
        .collect()
}

/// Group files by lowercased filename, bypassing the hash pipeline.
#[must_use]
pub fn name_only_groups(files: &[FileRecord]) -> BTreeMap<String, Vec<String>> {
    let mut by_name: HashMap<String, Vec<FileRecord>> = HashMap::new();
    for file in files {
        let Some(name) = file.path.file_name() else {
            continue;
        };
        by_name
            .entry(name.to_string_lossy().to_lowercase())
            .or_default()
            .push(file.clone());
    }

    let mut out = BTreeMap::new();
    for (name, members) in by_name {
        let members = dedup_inodes(members);
        if members.len() < 2 {
            continue;
        }
        let key = GroupKey::NameOnly { name }.encode();
        out.insert(key, paths_of(&members));
    }
    out
}

/// Finalize `(size, full_hash)` equivalence classes into encoded groups.
///
/// Members are inode-deduplicated; byte verification splits a hash group
/// on mismatch, suffixing the hash payload for subgroups beyond the
/// first. Returns `None` when cancelled mid-verification.
#[must_use]
pub fn finalize_content_groups(
    classes: Vec<(u64, String, Vec<FileRecord>)>,
    mode: ScanMode,
    byte_verify: bool,
    cancel: &AtomicBool,
    metrics: &ScanMetrics,
) -> Option<BTreeMap<String, Vec<String>>> {
    let mut out = BTreeMap::new();

    for (size, hash, members) in classes {
        let members = dedup_inodes(members);
        if members.len() < 2 {
            continue;
        }

        let verified: Vec<Vec<FileRecord>> = if byte_verify {
            match byte_verify_split(members, cancel, metrics) {
                Some(subgroups) => subgroups,
                None => return None,
            }
        } else {
            vec![members]
        };

        for (idx, subgroup) in verified.into_iter().enumerate() {
            if subgroup.len() < 2 {
                continue;
            }
            let hash_payload = if idx == 0 {
                hash.clone()
            } else {
                format!("{hash}.{idx}")
            };
            emit_group(&mut out, size, hash_payload, subgroup, mode);
        }
    }

    Some(out)
}

fn emit_group(
    out: &mut BTreeMap<String, Vec<String>>,
    size: u64,
    hash: String,
    members: Vec<FileRecord>,
    mode: ScanMode,
) {
    match mode {
        ScanMode::Content => {
            let key = GroupKey::Content { size, hash }.encode();
            out.insert(key, paths_of(&members));
        }
        ScanMode::ContentAndName => {
            let mut by_name: HashMap<String, Vec<FileRecord>> = HashMap::new();
            for member in members {
                let name = member
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                by_name.entry(name).or_default().push(member);
            }
            for (name, named) in by_name {
                if named.len() < 2 {
                    continue;
                }
                let key = GroupKey::Content {
                    size,
                    hash: format!("{hash}:{name}"),
                }
                .encode();
                out.insert(key, paths_of(&named));
            }
        }
        ScanMode::NameOnly => {
            // Name-only mode never reaches the content pipeline.
            debug_assert!(false, "name-only groups are built without hashing");
        }
    }
}

/// Split a hash group into byte-identical subgroups.
///
/// The first member of the pending pool becomes the basis of a subgroup;
/// every candidate comparing equal joins it, the rest wait for the next
/// basis. Returns `None` when cancelled.
fn byte_verify_split(
    members: Vec<FileRecord>,
    cancel: &AtomicBool,
    metrics: &ScanMetrics,
) -> Option<Vec<Vec<FileRecord>>> {
    let mut pending = members;
    let mut subgroups = Vec::new();

    while !pending.is_empty() {
        let basis = pending.remove(0);
        let mut group = vec![basis];
        let mut rest = Vec::new();

        for candidate in pending {
            match hasher::bytes_equal(&group[0].path, &candidate.path, cancel) {
                Ok(true) => group.push(candidate),
                Ok(false) => rest.push(candidate),
                Err(HashError::Interrupted(_)) => return None,
                Err(e) => {
                    metrics.record_hash_error(&e);
                }
            }
        }

        if group.len() > 1 {
            subgroups.push(group);
        }
        pending = rest;
    }

    Some(subgroups)
}

fn paths_of(members: &[FileRecord]) -> Vec<String> {
    let mut out: Vec<String> = members
        .iter()
        .map(|m| m.path.to_string_lossy().to_string())
        .collect();
    // Worker completion order is nondeterministic; emitted member lists
    // are not.
    out.sort();
    out
}
