//! Session store: durable per-run scan state.
//!
//! A session records one scan attempt: its normalized config and config
//! hash, status and stage, throttled progress, and four sub-collections
//! keyed by session id (files, hashes, results, selections). Paused
//! sessions with a matching config hash can be resumed; only completed
//! sessions serve as incremental baselines. The scheduler tables are
//! written here and consumed by the external scheduled-run orchestrator.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{now_epoch, Store, StoreHandle, StoreResult};
use crate::scanner::FileRecord;

/// Identifier of a session row.
pub type SessionId = i64;

/// Chunk size for `IN (...)` path queries.
const PATH_CHUNK: usize = 400;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Scan in progress.
    Running,
    /// Cancelled mid-run; resumable.
    Paused,
    /// Finished cleanly.
    Completed,
    /// Finished, but demoted by the strict-mode error threshold.
    Partial,
    /// Aborted by an unrecoverable error.
    Failed,
}

impl SessionStatus {
    /// Stable string form stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage recorded on the session.
///
/// On pause this records the last successfully completed stage; resume
/// re-enters at the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    /// File collection and filtering.
    Collect,
    /// Partial-hash pass over size-collided candidates.
    QuickHash,
    /// Full-hash pass over surviving candidates.
    FullHash,
    /// Group building and verification.
    Group,
    /// Folder-duplicate detection.
    FolderDup,
    /// Perceptual image grouping.
    SimilarImage,
    /// Result persistence and status resolution.
    Finalize,
}

impl ScanStage {
    /// Stable string form stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::QuickHash => "quick_hash",
            Self::FullHash => "full_hash",
            Self::Group => "group",
            Self::FolderDup => "folder_dup",
            Self::SimilarImage => "similar_image",
            Self::Finalize => "finalize",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collect" => Some(Self::Collect),
            "quick_hash" => Some(Self::QuickHash),
            "full_hash" => Some(Self::FullHash),
            "group" => Some(Self::Group),
            "folder_dup" => Some(Self::FolderDup),
            "similar_image" => Some(Self::SimilarImage),
            "finalize" => Some(Self::Finalize),
            _ => None,
        }
    }
}

impl fmt::Display for ScanStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which digest a `session_hashes` row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    /// Prefix digest.
    Partial,
    /// Whole-content digest.
    Full,
    /// Perceptual image hash.
    Phash,
}

impl HashKind {
    /// Stable string form stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Partial => "PARTIAL",
            Self::Full => "FULL",
            Self::Phash => "PHASH",
        }
    }
}

/// A hash value destined for `session_hashes`.
#[derive(Debug, Clone)]
pub struct SessionHashRow {
    /// Candidate path.
    pub path: String,
    /// Witness size.
    pub size: u64,
    /// Witness mtime in epoch seconds.
    pub mtime: i64,
    /// Digest kind.
    pub kind: HashKind,
    /// Digest value (hex for content hashes, base64 for pHash).
    pub value: String,
}

/// A session row.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Session id.
    pub id: SessionId,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Last recorded stage.
    pub stage: ScanStage,
    /// Normalized config JSON.
    pub config_json: String,
    /// Config hash used for resume/baseline matching.
    pub config_hash: String,
    /// Creation time, epoch seconds.
    pub created_at: i64,
    /// Last update time, epoch seconds.
    pub updated_at: i64,
    /// Progress percent (0..=100).
    pub progress: u8,
    /// Last progress message.
    pub progress_message: String,
}

/// A view of the session tables on a dedicated connection handle.
pub struct SessionStore {
    handle: Arc<StoreHandle>,
}

impl SessionStore {
    /// Open a handle on the shared store.
    ///
    /// # Errors
    ///
    /// Fails when a new connection cannot be opened.
    pub fn new(store: &Arc<Store>) -> StoreResult<Self> {
        Ok(Self {
            handle: store.handle()?,
        })
    }

    /// Create a new `running` session at the `collect` stage.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn create_session(&self, config_json: &str, config_hash: &str) -> StoreResult<SessionId> {
        let now = now_epoch();
        self.handle.with(|conn| {
            conn.execute(
                "INSERT INTO sessions
                 (status, stage, config_json, config_hash, created_at, updated_at, progress, progress_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, '')",
                params![
                    SessionStatus::Running.as_str(),
                    ScanStage::Collect.as_str(),
                    config_json,
                    config_hash,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Fetch a session by id.
    ///
    /// # Errors
    ///
    /// Forwards database errors; an unknown id is `Ok(None)`.
    pub fn get_session(&self, id: SessionId) -> StoreResult<Option<SessionRecord>> {
        self.handle.with(|conn| {
            conn.query_row(
                "SELECT id, status, stage, config_json, config_hash,
                        created_at, updated_at, progress, progress_message
                 FROM sessions WHERE id=?1",
                [id],
                map_session_row,
            )
            .optional()
        })
    }

    /// Record a status/stage transition.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn update_state(
        &self,
        id: SessionId,
        status: SessionStatus,
        stage: ScanStage,
    ) -> StoreResult<()> {
        self.handle.with(|conn| {
            conn.execute(
                "UPDATE sessions SET status=?1, stage=?2, updated_at=?3 WHERE id=?4",
                params![status.as_str(), stage.as_str(), now_epoch(), id],
            )?;
            Ok(())
        })
    }

    /// Persist a throttled progress update.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn update_progress(&self, id: SessionId, progress: u8, message: &str) -> StoreResult<()> {
        self.handle.with(|conn| {
            conn.execute(
                "UPDATE sessions SET progress=?1, progress_message=?2, updated_at=?3 WHERE id=?4",
                params![i64::from(progress.min(100)), message, now_epoch(), id],
            )?;
            Ok(())
        })
    }

    /// Latest `paused` or `running` session with this config hash.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn find_resumable_by_hash(&self, config_hash: &str) -> StoreResult<Option<SessionRecord>> {
        self.handle.with(|conn| {
            conn.query_row(
                "SELECT id, status, stage, config_json, config_hash,
                        created_at, updated_at, progress, progress_message
                 FROM sessions
                 WHERE config_hash=?1 AND status IN ('running', 'paused')
                 ORDER BY updated_at DESC LIMIT 1",
                [config_hash],
                map_session_row,
            )
            .optional()
        })
    }

    /// Latest `completed` session with this config hash; the only kind
    /// eligible as an incremental baseline.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn latest_completed_by_hash(&self, config_hash: &str) -> StoreResult<Option<SessionRecord>> {
        self.handle.with(|conn| {
            conn.query_row(
                "SELECT id, status, stage, config_json, config_hash,
                        created_at, updated_at, progress, progress_message
                 FROM sessions
                 WHERE config_hash=?1 AND status='completed'
                 ORDER BY updated_at DESC LIMIT 1",
                [config_hash],
                map_session_row,
            )
            .optional()
        })
    }

    /// Garbage-collect all but the most recent `keep_latest` sessions,
    /// with every dependent row.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn cleanup_old_sessions(&self, keep_latest: u32) -> StoreResult<()> {
        let keep = keep_latest.max(1);
        self.handle.with(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(&format!(
                "CREATE TEMP TABLE keep_ids AS
                     SELECT id FROM sessions ORDER BY updated_at DESC LIMIT {keep};
                 DELETE FROM session_files    WHERE session_id NOT IN (SELECT id FROM keep_ids);
                 DELETE FROM session_hashes   WHERE session_id NOT IN (SELECT id FROM keep_ids);
                 DELETE FROM session_results  WHERE session_id NOT IN (SELECT id FROM keep_ids);
                 DELETE FROM session_selected WHERE session_id NOT IN (SELECT id FROM keep_ids);
                 DELETE FROM sessions         WHERE id NOT IN (SELECT id FROM keep_ids);
                 DROP TABLE keep_ids;"
            ))?;
            tx.commit()
        })
    }

    /// Append collected file records for a session.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn save_files_batch(&self, id: SessionId, files: &[FileRecord]) -> StoreResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        self.handle.with(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO session_files
                     (session_id, path, size, mtime, dev, ino)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for file in files {
                    stmt.execute(params![
                        id,
                        file.path.to_string_lossy(),
                        file.size,
                        file.mtime,
                        file.dev,
                        file.ino,
                    ])?;
                }
            }
            tx.commit()
        })
    }

    /// Whether any files were persisted for a session.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn has_files(&self, id: SessionId) -> StoreResult<bool> {
        self.handle.with(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM session_files WHERE session_id=?1 LIMIT 1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Load the persisted file set of a session.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn load_files(&self, id: SessionId) -> StoreResult<Vec<FileRecord>> {
        self.handle.with(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT path, size, mtime, dev, ino FROM session_files WHERE session_id=?1",
            )?;
            let rows = stmt.query_map([id], |row| {
                Ok(FileRecord {
                    path: std::path::PathBuf::from(row.get::<_, String>(0)?),
                    size: row.get(1)?,
                    mtime: row.get(2)?,
                    dev: row.get(3)?,
                    ino: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Remove persisted files that vanished from disk between runs.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn remove_files(&self, id: SessionId, paths: &[String]) -> StoreResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        self.handle.with(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "DELETE FROM session_files WHERE session_id=?1 AND path=?2",
                )?;
                for path in paths {
                    stmt.execute(params![id, path])?;
                }
            }
            tx.commit()
        })
    }

    /// Save hash rows, deduplicated per `(path, kind)` within the batch.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn save_hashes_batch(&self, id: SessionId, rows: &[SessionHashRow]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut seen: HashSet<(&str, HashKind)> = HashSet::new();
        let deduped: Vec<&SessionHashRow> = rows
            .iter()
            .filter(|row| seen.insert((row.path.as_str(), row.kind)))
            .collect();

        self.handle.with(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO session_hashes
                     (session_id, path, size, mtime, hash_type, hash_value)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for row in &deduped {
                    stmt.execute(params![
                        id,
                        row.path,
                        row.size,
                        row.mtime,
                        row.kind.as_str(),
                        row.value,
                    ])?;
                }
            }
            tx.commit()
        })
    }

    /// Load hashes of one kind for the given paths, chunked to keep the
    /// SQLite variable count conservative.
    ///
    /// Returns `path → (value, size, mtime)`.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn load_hashes_for_paths(
        &self,
        id: SessionId,
        paths: &[String],
        kind: HashKind,
    ) -> StoreResult<HashMap<String, (String, u64, i64)>> {
        let mut out = HashMap::new();
        for chunk in paths.chunks(PATH_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT path, hash_value, size, mtime FROM session_hashes
                 WHERE session_id=? AND hash_type=? AND path IN ({placeholders})"
            );
            self.handle.with(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut params: Vec<&dyn rusqlite::ToSql> = vec![&id];
                let kind_str = kind.as_str();
                params.push(&kind_str);
                for path in chunk {
                    params.push(path);
                }
                let rows = stmt.query_map(params.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?;
                for row in rows {
                    let (path, value, size, mtime) = row?;
                    out.insert(path, (value, size, mtime));
                }
                Ok(())
            })?;
        }
        Ok(out)
    }

    /// Replace the persisted result groups of a session.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn save_results(
        &self,
        id: SessionId,
        results: &std::collections::BTreeMap<String, Vec<String>>,
    ) -> StoreResult<()> {
        self.handle.with(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM session_results WHERE session_id=?1", [id])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO session_results (session_id, group_key, path)
                     VALUES (?1, ?2, ?3)",
                )?;
                for (key, paths) in results {
                    for path in paths {
                        stmt.execute(params![id, key, path])?;
                    }
                }
            }
            tx.commit()
        })
    }

    /// Load the persisted result groups of a session.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn load_results(
        &self,
        id: SessionId,
    ) -> StoreResult<std::collections::BTreeMap<String, Vec<String>>> {
        self.handle.with(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT group_key, path FROM session_results
                 WHERE session_id=?1 ORDER BY group_key, path",
            )?;
            let rows = stmt.query_map([id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out: std::collections::BTreeMap<String, Vec<String>> =
                std::collections::BTreeMap::new();
            for row in rows {
                let (key, path) = row?;
                out.entry(key).or_default().push(path);
            }
            Ok(out)
        })
    }

    /// Replace the selection set of a session.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn save_selected(&self, id: SessionId, paths: &[String]) -> StoreResult<()> {
        self.handle.with(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM session_selected WHERE session_id=?1", [id])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO session_selected (session_id, path, selected)
                     VALUES (?1, ?2, 1)",
                )?;
                for path in paths {
                    stmt.execute(params![id, path])?;
                }
            }
            tx.commit()
        })
    }

    /// Load the selected paths of a session.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn load_selected(&self, id: SessionId) -> StoreResult<HashSet<String>> {
        self.handle.with(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT path FROM session_selected WHERE session_id=?1 AND selected=1",
            )?;
            let rows = stmt.query_map([id], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
    }

    /// Create or update a scheduled job definition.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn upsert_job(
        &self,
        name: &str,
        enabled: bool,
        schedule: &str,
        time_hhmm: &str,
        config_json: &str,
    ) -> StoreResult<()> {
        self.handle.with(|conn| {
            conn.execute(
                "INSERT INTO scheduled_jobs (name, enabled, schedule, time_hhmm, config_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(name) DO UPDATE SET
                     enabled=excluded.enabled,
                     schedule=excluded.schedule,
                     time_hhmm=excluded.time_hhmm,
                     config_json=excluded.config_json,
                     updated_at=excluded.updated_at",
                params![name, enabled, schedule, time_hhmm, config_json, now_epoch()],
            )?;
            Ok(())
        })
    }

    /// Record the start of a scheduled run.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn create_run(&self, job_name: &str, session: Option<SessionId>) -> StoreResult<i64> {
        self.handle.with(|conn| {
            conn.execute(
                "INSERT INTO scheduled_runs (job_name, started_at, status, session_id)
                 VALUES (?1, ?2, 'running', ?3)",
                params![job_name, now_epoch(), session],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Record the completion of a scheduled run.
    ///
    /// # Errors
    ///
    /// Forwards database errors.
    pub fn finish_run(&self, run_id: i64, status: &str, message: &str) -> StoreResult<()> {
        self.handle.with(|conn| {
            conn.execute(
                "UPDATE scheduled_runs SET finished_at=?1, status=?2, message=?3 WHERE id=?4",
                params![now_epoch(), status, message, run_id],
            )?;
            Ok(())
        })
    }
}

fn map_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(1)?;
    let stage: String = row.get(2)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
        stage: ScanStage::parse(&stage).unwrap_or(ScanStage::Collect),
        config_json: row.get(3)?,
        config_hash: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        progress: row.get::<_, i64>(7)?.clamp(0, 100) as u8,
        progress_message: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
    })
}
