//! Persistent fingerprint cache.
//!
//! Maps canonical absolute paths to `(size, mtime, partial_hash,
//! full_hash, last_seen)`. A row only counts as a cache hit when the live
//! file's `(size, mtime)` equals the stored witness exactly; stale rows
//! are recomputed, never returned. `last_seen` is refreshed on every read
//! and write so the retention sweep keeps rows that are still in use.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use super::{now_epoch, Store, StoreHandle, StoreResult};
use crate::scanner::{hash_to_hex, hex_to_hash, Hash};

/// Maximum rows written per transaction.
const BATCH_LIMIT: usize = 500;

/// Cached digests for a path, valid for a specific `(size, mtime)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fingerprint {
    /// Digest of the first 64 KiB, when computed.
    pub partial: Option<Hash>,
    /// Digest of the full content, when computed.
    pub full: Option<Hash>,
}

/// One upsert destined for the cache.
#[derive(Debug, Clone)]
pub struct FingerprintRow {
    /// Canonical absolute path.
    pub path: String,
    /// Witness size in bytes.
    pub size: u64,
    /// Witness mtime in epoch seconds.
    pub mtime: i64,
    /// New partial digest, `None` to preserve the stored value.
    pub partial: Option<Hash>,
    /// New full digest, `None` to preserve the stored value.
    pub full: Option<Hash>,
}

/// A per-worker view of the fingerprint cache.
pub struct FingerprintStore {
    handle: Arc<StoreHandle>,
}

impl FingerprintStore {
    /// Open a worker handle on the shared store.
    ///
    /// # Errors
    ///
    /// Fails when a new connection cannot be opened.
    pub fn new(store: &Arc<Store>) -> StoreResult<Self> {
        Ok(Self {
            handle: store.handle()?,
        })
    }

    /// Look up cached digests for a path.
    ///
    /// Returns `Some` only when the stored `(size, mtime)` witness matches
    /// the caller's exactly; the hit refreshes `last_seen`.
    ///
    /// # Errors
    ///
    /// Forwards database errors; a missing row is `Ok(None)`.
    pub fn lookup(&self, path: &Path, size: u64, mtime: i64) -> StoreResult<Option<Fingerprint>> {
        let key = path.to_string_lossy().to_string();
        self.handle.with(|conn| {
            let row: Option<(Option<String>, Option<String>)> = conn
                .query_row(
                    "SELECT hash_partial, hash_full FROM file_hashes
                     WHERE path=?1 AND size=?2 AND mtime=?3",
                    params![key, size, mtime],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                None => Ok(None),
                Some((partial, full)) => {
                    conn.execute(
                        "UPDATE file_hashes SET last_seen=?1 WHERE path=?2",
                        params![now_epoch(), key],
                    )?;
                    Ok(Some(Fingerprint {
                        partial: partial.as_deref().and_then(hex_to_hash),
                        full: full.as_deref().and_then(hex_to_hash),
                    }))
                }
            }
        })
    }

    /// Upsert a single partial hash.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn put_partial(&self, path: &Path, size: u64, mtime: i64, hash: Hash) -> StoreResult<()> {
        self.apply_batch(&[FingerprintRow {
            path: path.to_string_lossy().to_string(),
            size,
            mtime,
            partial: Some(hash),
            full: None,
        }])
    }

    /// Upsert a single full hash.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn put_full(&self, path: &Path, size: u64, mtime: i64, hash: Hash) -> StoreResult<()> {
        self.apply_batch(&[FingerprintRow {
            path: path.to_string_lossy().to_string(),
            size,
            mtime,
            partial: None,
            full: Some(hash),
        }])
    }

    /// Apply a batch of upserts, at most 500 rows per transaction.
    ///
    /// An upsert with `None` for one digest preserves whatever the row
    /// already holds for that column; `last_seen` is refreshed.
    ///
    /// # Errors
    ///
    /// Forwards database errors; a failed chunk rolls back atomically.
    pub fn apply_batch(&self, rows: &[FingerprintRow]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        for chunk in rows.chunks(BATCH_LIMIT) {
            self.handle.with(|conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO file_hashes (path, size, mtime, hash_partial, hash_full, last_seen)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(path) DO UPDATE SET
                             size=excluded.size,
                             mtime=excluded.mtime,
                             hash_partial=COALESCE(excluded.hash_partial, file_hashes.hash_partial),
                             hash_full=COALESCE(excluded.hash_full, file_hashes.hash_full),
                             last_seen=excluded.last_seen",
                    )?;
                    let now = now_epoch();
                    for row in chunk {
                        stmt.execute(params![
                            row.path,
                            row.size,
                            row.mtime,
                            row.partial.as_ref().map(hash_to_hex),
                            row.full.as_ref().map(hash_to_hex),
                            now,
                        ])?;
                    }
                }
                tx.commit()
            })?;
        }
        Ok(())
    }

    /// Delete rows whose `last_seen` is older than the threshold.
    ///
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn sweep(&self, age_days: u32) -> StoreResult<usize> {
        let cutoff = now_epoch() - i64::from(age_days) * 24 * 60 * 60;
        let removed = self.handle.with(|conn| {
            conn.execute("DELETE FROM file_hashes WHERE last_seen < ?1", [cutoff])
        })?;
        if removed > 0 {
            log::info!("Fingerprint sweep removed {removed} rows older than {age_days} days");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> (Arc<Store>, FingerprintStore) {
        let store = Store::open(&dir.path().join("cache.db")).unwrap();
        let fps = FingerprintStore::new(&store).unwrap();
        (store, fps)
    }

    fn sample_hash(seed: u8) -> Hash {
        [seed; 16]
    }

    #[test]
    fn test_lookup_miss() {
        let dir = TempDir::new().unwrap();
        let (_store, fps) = open(&dir);
        let got = fps.lookup(Path::new("/x/a.bin"), 10, 100).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn test_put_and_lookup_hit() {
        let dir = TempDir::new().unwrap();
        let (_store, fps) = open(&dir);
        let path = PathBuf::from("/x/a.bin");

        fps.put_partial(&path, 10, 100, sample_hash(1)).unwrap();
        fps.put_full(&path, 10, 100, sample_hash(2)).unwrap();

        let got = fps.lookup(&path, 10, 100).unwrap().unwrap();
        assert_eq!(got.partial, Some(sample_hash(1)));
        assert_eq!(got.full, Some(sample_hash(2)));
    }

    #[test]
    fn test_witness_mismatch_is_not_a_hit() {
        let dir = TempDir::new().unwrap();
        let (_store, fps) = open(&dir);
        let path = PathBuf::from("/x/a.bin");

        fps.put_full(&path, 10, 100, sample_hash(3)).unwrap();

        assert_eq!(fps.lookup(&path, 11, 100).unwrap(), None);
        assert_eq!(fps.lookup(&path, 10, 101).unwrap(), None);
        assert!(fps.lookup(&path, 10, 100).unwrap().is_some());
    }

    #[test]
    fn test_upsert_preserves_other_column() {
        let dir = TempDir::new().unwrap();
        let (_store, fps) = open(&dir);
        let path = PathBuf::from("/x/a.bin");

        fps.put_partial(&path, 10, 100, sample_hash(1)).unwrap();
        fps.put_full(&path, 10, 100, sample_hash(2)).unwrap();

        let got = fps.lookup(&path, 10, 100).unwrap().unwrap();
        assert_eq!(got.partial, Some(sample_hash(1)));
        assert_eq!(got.full, Some(sample_hash(2)));
    }

    #[test]
    fn test_changed_witness_replaces_row() {
        let dir = TempDir::new().unwrap();
        let (_store, fps) = open(&dir);
        let path = PathBuf::from("/x/a.bin");

        fps.put_full(&path, 10, 100, sample_hash(2)).unwrap();
        // File changed on disk: new witness, new digest.
        fps.put_full(&path, 12, 200, sample_hash(4)).unwrap();

        assert_eq!(fps.lookup(&path, 10, 100).unwrap(), None);
        let got = fps.lookup(&path, 12, 200).unwrap().unwrap();
        assert_eq!(got.full, Some(sample_hash(4)));
    }

    #[test]
    fn test_apply_batch_over_limit() {
        let dir = TempDir::new().unwrap();
        let (_store, fps) = open(&dir);

        let rows: Vec<FingerprintRow> = (0..1203)
            .map(|i| FingerprintRow {
                path: format!("/bulk/file_{i}.bin"),
                size: 100,
                mtime: 1000,
                partial: Some(sample_hash(5)),
                full: None,
            })
            .collect();
        fps.apply_batch(&rows).unwrap();

        let got = fps
            .lookup(Path::new("/bulk/file_1202.bin"), 100, 1000)
            .unwrap();
        assert!(got.is_some());
    }

    #[test]
    fn test_sweep_removes_stale_rows() {
        let dir = TempDir::new().unwrap();
        let (store, fps) = open(&dir);
        let path = PathBuf::from("/x/old.bin");
        fps.put_full(&path, 10, 100, sample_hash(6)).unwrap();

        // Age the row artificially.
        let handle = store.handle().unwrap();
        handle
            .with(|conn| {
                conn.execute(
                    "UPDATE file_hashes SET last_seen = last_seen - 90*24*3600",
                    [],
                )
            })
            .unwrap();

        let removed = fps.sweep(30).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(fps.lookup(&path, 10, 100).unwrap(), None);
    }

    #[test]
    fn test_lookup_refreshes_last_seen() {
        let dir = TempDir::new().unwrap();
        let (store, fps) = open(&dir);
        let path = PathBuf::from("/x/warm.bin");
        fps.put_full(&path, 10, 100, sample_hash(7)).unwrap();

        let handle = store.handle().unwrap();
        handle
            .with(|conn| {
                conn.execute(
                    "UPDATE file_hashes SET last_seen = last_seen - 90*24*3600",
                    [],
                )
            })
            .unwrap();

        // A read revalidates the row, so the sweep keeps it.
        assert!(fps.lookup(&path, 10, 100).unwrap().is_some());
        assert_eq!(fps.sweep(30).unwrap(), 0);
    }
}
