//! Whole-folder duplicate detection via directory manifests.
//!
//! Each scanned directory gets a manifest: the sorted list of
//! `(filename, size, full_hash)` tuples of its direct file children.
//! Directories sharing a manifest hash form a `FolderDup` group. A cheap
//! pre-partition over `(filename, size)` manifests avoids hashing
//! directories that cannot possibly collide. Equivalence is local-level
//! by default; the recursive variant keys descendant files by relative
//! path so entire subtrees compare as one unit.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{GroupKey, ScanMetrics};
use crate::scanner::{hash_to_hex, hasher, FileRecord};
use crate::store::{FingerprintStore, StoreResult};

/// A file's contribution to one directory manifest.
#[derive(Debug, Clone)]
struct ManifestEntry {
    rel_path: String,
    size: u64,
    record: FileRecord,
}

/// Detect duplicate directories among the collected files.
///
/// Returns `Ok(None)` when cancelled; otherwise the encoded
/// `folder:<manifest-hash>` groups of two or more directories.
///
/// # Errors
///
/// Only storage failures escape; unreadable member files fall back to a
/// size token in the manifest and count toward telemetry.
pub fn detect_folder_duplicates(
    files: &[FileRecord],
    roots: &[PathBuf],
    recursive: bool,
    fingerprints: &FingerprintStore,
    metrics: &ScanMetrics,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(usize, usize),
) -> StoreResult<Option<BTreeMap<String, Vec<String>>>> {
    if files.is_empty() {
        return Ok(Some(BTreeMap::new()));
    }

    let members = collect_members(files, roots, recursive);

    // Pre-partition on (relative path, size) manifests; only colliding
    // directories pay for content hashes.
    let mut quick_groups: HashMap<String, Vec<(&Path, &Vec<ManifestEntry>)>> = HashMap::new();
    for (dir, entries) in &members {
        if cancel.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut lines: Vec<String> = entries
            .iter()
            .map(|e| format!("{}\0{}", e.rel_path, e.size))
            .collect();
        lines.sort();
        let quick_sig = manifest_hash(&lines);
        quick_groups
            .entry(quick_sig)
            .or_default()
            .push((dir.as_path(), entries));
    }

    let candidates: Vec<_> = quick_groups
        .into_values()
        .filter(|dirs| dirs.len() >= 2)
        .collect();
    let total_dirs: usize = candidates.iter().map(Vec::len).sum();
    let mut processed = 0usize;

    let mut out = BTreeMap::new();
    for dirs in candidates {
        let mut by_manifest: HashMap<String, Vec<String>> = HashMap::new();
        for (dir, entries) in dirs {
            if cancel.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let mut lines = Vec::with_capacity(entries.len());
            for entry in entries {
                let token = match full_hash_of(&entry.record, fingerprints, metrics, cancel)? {
                    Some(hex) => hex,
                    None if cancel.load(Ordering::SeqCst) => return Ok(None),
                    None => format!("size:{}", entry.size),
                };
                lines.push(format!("{}\0{}", entry.rel_path, token));
            }
            lines.sort();

            by_manifest
                .entry(manifest_hash(&lines))
                .or_default()
                .push(dir.to_string_lossy().to_string());

            processed += 1;
            on_progress(processed, total_dirs);
        }

        for (manifest, mut dirs) in by_manifest {
            if dirs.len() < 2 {
                continue;
            }
            dirs.sort();
            let key = GroupKey::FolderDup { manifest }.encode();
            out.insert(key, dirs);
        }
    }

    Ok(Some(out))
}

/// Assign every file to the directories whose manifest it belongs to.
fn collect_members(
    files: &[FileRecord],
    roots: &[PathBuf],
    recursive: bool,
) -> HashMap<PathBuf, Vec<ManifestEntry>> {
    let mut members: HashMap<PathBuf, Vec<ManifestEntry>> = HashMap::new();

    for file in files {
        let Some(parent) = file.path.parent() else {
            continue;
        };
        let Some(name) = file.path.file_name() else {
            continue;
        };

        members
            .entry(parent.to_path_buf())
            .or_default()
            .push(ManifestEntry {
                rel_path: name.to_string_lossy().replace('\\', "/"),
                size: file.size,
                record: file.clone(),
            });

        if !recursive {
            continue;
        }

        // Ancestors up to (and including) the containing root also see
        // this file, keyed by relative path.
        let mut ancestor = parent.to_path_buf();
        while !roots.iter().any(|r| ancestor.as_path() == r.as_path()) {
            let Some(next) = ancestor.parent().map(Path::to_path_buf) else {
                break;
            };
            if next == ancestor {
                break;
            }
            if !roots.iter().any(|r| file.path.starts_with(r)) {
                break;
            }
            let Ok(rel) = file.path.strip_prefix(&next) else {
                break;
            };
            members
                .entry(next.clone())
                .or_default()
                .push(ManifestEntry {
                    rel_path: rel.to_string_lossy().replace('\\', "/"),
                    size: file.size,
                    record: file.clone(),
                });
            ancestor = next;
        }
    }

    members
}

/// 128-bit digest over the canonical manifest serialization.
fn manifest_hash(sorted_lines: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(sorted_lines.join("\n").as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.as_bytes()[..16]);
    hash_to_hex(&out)
}

/// Full hash of a member file: cache hit, or compute-and-store.
fn full_hash_of(
    record: &FileRecord,
    fingerprints: &FingerprintStore,
    metrics: &ScanMetrics,
    cancel: &AtomicBool,
) -> StoreResult<Option<String>> {
    if let Some(fp) = fingerprints.lookup(&record.path, record.size, record.mtime)? {
        if let Some(full) = fp.full {
            return Ok(Some(hash_to_hex(&full)));
        }
    }

    match hasher::hash_full(&record.path, cancel) {
        Ok(hash) => {
            fingerprints.put_full(&record.path, record.size, record.mtime, hash)?;
            Ok(Some(hash_to_hex(&hash)))
        }
        Err(crate::scanner::HashError::Interrupted(_)) => Ok(None),
        Err(e) => {
            metrics.record_hash_error(&e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        fingerprints: FingerprintStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("cache.db")).unwrap();
        let fingerprints = FingerprintStore::new(&store).unwrap();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        Fixture {
            _dir: dir,
            root,
            fingerprints,
        }
    }

    fn record_for(path: &Path) -> FileRecord {
        let metadata = fs::metadata(path).unwrap();
        FileRecord::from_metadata(path.to_path_buf(), &metadata)
    }

    fn populate(root: &Path, dir: &str, files: &[(&str, &[u8])]) -> Vec<FileRecord> {
        let dir_path = root.join(dir);
        fs::create_dir_all(&dir_path).unwrap();
        files
            .iter()
            .map(|(name, content)| {
                let path = dir_path.join(name);
                fs::write(&path, content).unwrap();
                record_for(&path)
            })
            .collect()
    }

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_identical_folders_grouped() {
        let fx = fixture();
        let mut files = populate(&fx.root, "left", &[("a.txt", b"alpha"), ("b.txt", b"beta")]);
        files.extend(populate(
            &fx.root,
            "right",
            &[("a.txt", b"alpha"), ("b.txt", b"beta")],
        ));
        files.extend(populate(&fx.root, "other", &[("a.txt", b"different")]));

        let metrics = ScanMetrics::new();
        let groups = detect_folder_duplicates(
            &files,
            &[fx.root.clone()],
            false,
            &fx.fingerprints,
            &metrics,
            &no_cancel(),
            |_, _| {},
        )
        .unwrap()
        .unwrap();

        assert_eq!(groups.len(), 1);
        let (key, dirs) = groups.iter().next().unwrap();
        assert!(key.starts_with("folder:"));
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].ends_with("left"));
        assert!(dirs[1].ends_with("right"));
    }

    #[test]
    fn test_same_names_different_content_not_grouped() {
        let fx = fixture();
        let mut files = populate(&fx.root, "left", &[("a.txt", b"alpha")]);
        files.extend(populate(&fx.root, "right", &[("a.txt", b"OMEGA")]));

        let metrics = ScanMetrics::new();
        let groups = detect_folder_duplicates(
            &files,
            &[fx.root.clone()],
            false,
            &fx.fingerprints,
            &metrics,
            &no_cancel(),
            |_, _| {},
        )
        .unwrap()
        .unwrap();

        assert!(groups.is_empty());
    }

    #[test]
    fn test_local_mode_ignores_subdirectories() {
        let fx = fixture();
        // Same direct children; differing nested content.
        let mut files = populate(&fx.root, "left", &[("a.txt", b"alpha")]);
        files.extend(populate(&fx.root, "left/nested", &[("x.txt", b"one")]));
        files.extend(populate(&fx.root, "right", &[("a.txt", b"alpha")]));
        files.extend(populate(&fx.root, "right/nested", &[("x.txt", b"two")]));

        let metrics = ScanMetrics::new();
        let groups = detect_folder_duplicates(
            &files,
            &[fx.root.clone()],
            false,
            &fx.fingerprints,
            &metrics,
            &no_cancel(),
            |_, _| {},
        )
        .unwrap()
        .unwrap();

        // Local-level equivalence: left and right still match on their
        // direct children.
        assert!(groups
            .values()
            .any(|dirs| dirs.len() == 2 && dirs.iter().all(|d| !d.contains("nested"))));
    }

    #[test]
    fn test_recursive_mode_sees_nested_difference() {
        let fx = fixture();
        let mut files = populate(&fx.root, "left", &[("a.txt", b"alpha")]);
        files.extend(populate(&fx.root, "left/nested", &[("x.txt", b"one")]));
        files.extend(populate(&fx.root, "right", &[("a.txt", b"alpha")]));
        files.extend(populate(&fx.root, "right/nested", &[("x.txt", b"two")]));

        let metrics = ScanMetrics::new();
        let groups = detect_folder_duplicates(
            &files,
            &[fx.root.clone()],
            true,
            &fx.fingerprints,
            &metrics,
            &no_cancel(),
            |_, _| {},
        )
        .unwrap()
        .unwrap();

        // Nested contents differ, so the parent folders no longer match
        // as whole subtrees.
        let top_group = groups.values().find(|dirs| {
            dirs.iter().any(|d| d.ends_with("left")) && dirs.iter().any(|d| d.ends_with("right"))
        });
        assert!(top_group.is_none());
    }

    #[test]
    fn test_recursive_mode_groups_identical_subtrees() {
        let fx = fixture();
        let mut files = populate(&fx.root, "left", &[("a.txt", b"alpha")]);
        files.extend(populate(&fx.root, "left/nested", &[("x.txt", b"one")]));
        files.extend(populate(&fx.root, "right", &[("a.txt", b"alpha")]));
        files.extend(populate(&fx.root, "right/nested", &[("x.txt", b"one")]));

        let metrics = ScanMetrics::new();
        let groups = detect_folder_duplicates(
            &files,
            &[fx.root.clone()],
            true,
            &fx.fingerprints,
            &metrics,
            &no_cancel(),
            |_, _| {},
        )
        .unwrap()
        .unwrap();

        let top_group = groups.values().find(|dirs| {
            dirs.iter().any(|d| d.ends_with("left")) && dirs.iter().any(|d| d.ends_with("right"))
        });
        assert!(top_group.is_some());
    }

    #[test]
    fn test_cancel_returns_none() {
        let fx = fixture();
        let files = populate(&fx.root, "left", &[("a.txt", b"alpha")]);
        let metrics = ScanMetrics::new();
        let cancel = AtomicBool::new(true);

        let result = detect_folder_duplicates(
            &files,
            &[fx.root.clone()],
            false,
            &fx.fingerprints,
            &metrics,
            &cancel,
            |_, _| {},
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_empty_input() {
        let fx = fixture();
        let metrics = ScanMetrics::new();
        let groups = detect_folder_duplicates(
            &[],
            &[fx.root.clone()],
            false,
            &fx.fingerprints,
            &metrics,
            &no_cancel(),
            |_, _| {},
        )
        .unwrap()
        .unwrap();
        assert!(groups.is_empty());
    }
}
