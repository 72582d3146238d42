//! Bounded parallel hash pipeline.
//!
//! Consumes `(path, size, mtime)` tuples collected by the walker — never
//! re-stats — and produces digest-keyed partitions. A pool of
//! `min(cpu_count, max_workers)` OS threads pulls tasks from a queue
//! bounded at four slots per worker: the producer blocks on a saturated
//! queue instead of materializing millions of pending tasks.
//!
//! Every task consults the fingerprint cache first; a hit skips the file
//! read entirely and still refreshes `last_seen`. New digests flow back
//! through batched cache and session writes on the producer thread.
//! Per-file faults are classified into telemetry and never fail a stage.
//! Once the cancel flag rises, queued tasks are drained without
//! execution while in-flight work completes and is persisted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel};
use std::sync::{Arc, Mutex};

use super::ScanMetrics;
use crate::scanner::{hash_to_hex, hasher, FileRecord, Hash, HashError};
use crate::store::{
    FingerprintRow, FingerprintStore, HashKind, SessionHashRow, SessionId, SessionStore, Store,
    StoreResult,
};

/// Files at or above this size get a partial hash in the quick pass;
/// smaller files go straight to a full digest.
pub const QUICK_PARTIAL_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Candidates are processed in chunks so session-cache prefetches stay
/// bounded.
const CANDIDATE_CHUNK: usize = 800;

/// Fingerprint write-back flush threshold.
const CACHE_FLUSH: usize = 500;

/// Session-hash write flush threshold.
const SESSION_FLUSH: usize = 200;

/// Result of one hashing pass.
#[derive(Debug, Default)]
pub struct HashPassOutput {
    /// Partition of candidates by `(size, digest, kind)`.
    pub groups: HashMap<(u64, String, HashKind), Vec<PathBuf>>,
    /// Whether the pass was interrupted by cancellation.
    pub cancelled: bool,
}

/// Shared context for the hashing passes of one scan.
pub struct PipelineContext<'a> {
    /// Shared database.
    pub store: &'a Arc<Store>,
    /// Session store view on the orchestrator thread.
    pub sessions: &'a SessionStore,
    /// Session being built.
    pub session_id: SessionId,
    /// Completed baseline session whose hashes may seed this run.
    pub seed_session: Option<SessionId>,
    /// Telemetry counters.
    pub metrics: &'a ScanMetrics,
    /// Shared cancel flag.
    pub cancel: &'a Arc<AtomicBool>,
    /// Worker-pool size.
    pub workers: usize,
}

#[derive(Debug)]
struct HashTask {
    path: PathBuf,
    size: u64,
    mtime: i64,
    kind: HashKind,
}

#[derive(Debug)]
struct HashOutcome {
    path: PathBuf,
    size: u64,
    mtime: i64,
    kind: HashKind,
    result: Result<(Hash, bool), HashError>,
}

/// Run one hashing pass over the candidates.
///
/// In the quick pass (`quick = true`) large files get a partial digest
/// and small files a full one; the full pass always digests whole
/// contents. `on_progress` receives `(processed, total)` from the
/// producer thread.
///
/// # Errors
///
/// Only storage failures escape; per-file faults are absorbed into
/// telemetry.
pub fn run_pass(
    ctx: &PipelineContext<'_>,
    candidates: &[FileRecord],
    quick: bool,
    mut on_progress: impl FnMut(usize, usize),
) -> StoreResult<HashPassOutput> {
    let mut output = HashPassOutput::default();
    let total = candidates.len();
    if total == 0 {
        return Ok(output);
    }

    let workers = ctx.workers.max(1);
    let (task_tx, task_rx) = sync_channel::<HashTask>(workers * 4);
    let task_rx = Arc::new(Mutex::new(task_rx));
    let (outcome_tx, outcome_rx) = channel::<HashOutcome>();

    let mut worker_caches = Vec::with_capacity(workers);
    for _ in 0..workers {
        worker_caches.push(FingerprintStore::new(ctx.store)?);
    }

    let mut processed = 0usize;
    let mut cache_batch: Vec<FingerprintRow> = Vec::new();
    let mut session_batch: Vec<SessionHashRow> = Vec::new();

    std::thread::scope(|scope| -> StoreResult<()> {
        for cache in worker_caches {
            let task_rx = Arc::clone(&task_rx);
            let outcome_tx = outcome_tx.clone();
            let cancel = Arc::clone(ctx.cancel);
            scope.spawn(move || worker_loop(&task_rx, &outcome_tx, &cache, &cancel));
        }
        drop(outcome_tx);

        for chunk in candidates.chunks(CANDIDATE_CHUNK) {
            if ctx.cancel.load(Ordering::SeqCst) {
                break;
            }

            let chunk_paths: Vec<String> = chunk
                .iter()
                .map(|c| c.path.to_string_lossy().to_string())
                .collect();

            let session_partial = if quick {
                ctx.sessions.load_hashes_for_paths(
                    ctx.session_id,
                    &chunk_paths,
                    HashKind::Partial,
                )?
            } else {
                HashMap::new()
            };
            let session_full =
                ctx.sessions
                    .load_hashes_for_paths(ctx.session_id, &chunk_paths, HashKind::Full)?;

            let (seed_partial, seed_full) = match ctx.seed_session {
                Some(seed) if seed != ctx.session_id => {
                    let partial = if quick {
                        ctx.sessions
                            .load_hashes_for_paths(seed, &chunk_paths, HashKind::Partial)?
                    } else {
                        HashMap::new()
                    };
                    let full =
                        ctx.sessions
                            .load_hashes_for_paths(seed, &chunk_paths, HashKind::Full)?;
                    (partial, full)
                }
                _ => (HashMap::new(), HashMap::new()),
            };

            for candidate in chunk {
                if ctx.cancel.load(Ordering::SeqCst) {
                    break;
                }

                let kind = if quick && candidate.size >= QUICK_PARTIAL_THRESHOLD {
                    HashKind::Partial
                } else {
                    HashKind::Full
                };
                let path_key = candidate.path.to_string_lossy().to_string();

                let replayed = {
                    let (session_map, seed_map) = match kind {
                        HashKind::Partial => (&session_partial, &seed_partial),
                        _ => (&session_full, &seed_full),
                    };
                    session_map
                        .get(&path_key)
                        .or_else(|| seed_map.get(&path_key))
                        .filter(|(_, size, mtime)| {
                            *size == candidate.size && *mtime == candidate.mtime
                        })
                        .map(|(value, _, _)| value.clone())
                };

                if let Some(value) = replayed {
                    output
                        .groups
                        .entry((candidate.size, value.clone(), kind))
                        .or_default()
                        .push(candidate.path.clone());
                    ctx.metrics.record_hashed();
                    session_batch.push(SessionHashRow {
                        path: path_key,
                        size: candidate.size,
                        mtime: candidate.mtime,
                        kind,
                        value,
                    });
                    processed += 1;
                    on_progress(processed, total);
                } else {
                    let task = HashTask {
                        path: candidate.path.clone(),
                        size: candidate.size,
                        mtime: candidate.mtime,
                        kind,
                    };
                    // Blocking send: backpressure bounds memory.
                    if task_tx.send(task).is_err() {
                        break;
                    }
                }

                // Absorb finished work while producing.
                while let Ok(outcome) = outcome_rx.try_recv() {
                    processed += 1;
                    absorb_outcome(
                        ctx,
                        outcome,
                        &mut output,
                        &mut cache_batch,
                        &mut session_batch,
                    )?;
                    on_progress(processed, total);
                }

                flush_if_due(ctx, &mut cache_batch, &mut session_batch)?;
            }
        }

        drop(task_tx);

        while let Ok(outcome) = outcome_rx.recv() {
            processed += 1;
            absorb_outcome(
                ctx,
                outcome,
                &mut output,
                &mut cache_batch,
                &mut session_batch,
            )?;
            on_progress(processed, total);
            flush_if_due(ctx, &mut cache_batch, &mut session_batch)?;
        }

        Ok(())
    })?;

    // In-flight results are always persisted, even after cancellation.
    flush_cache(ctx, &mut cache_batch)?;
    flush_session(ctx, &mut session_batch)?;

    output.cancelled = ctx.cancel.load(Ordering::SeqCst);
    Ok(output)
}

fn worker_loop(
    task_rx: &Mutex<std::sync::mpsc::Receiver<HashTask>>,
    outcome_tx: &std::sync::mpsc::Sender<HashOutcome>,
    cache: &FingerprintStore,
    cancel: &AtomicBool,
) {
    loop {
        let task = {
            let guard = task_rx.lock().unwrap();
            guard.recv()
        };
        let Ok(task) = task else {
            return;
        };

        // Queued tasks drain without execution once cancelled.
        if cancel.load(Ordering::SeqCst) {
            continue;
        }

        let cached = match cache.lookup(&task.path, task.size, task.mtime) {
            Ok(hit) => hit,
            Err(e) => {
                log::debug!("Cache lookup failed for {}: {e}", task.path.display());
                None
            }
        };
        let cached_digest = cached.and_then(|fp| match task.kind {
            HashKind::Partial => fp.partial,
            _ => fp.full,
        });

        let result = match cached_digest {
            Some(hash) => Ok((hash, false)),
            None => {
                let computed = match task.kind {
                    HashKind::Partial => hasher::hash_partial(&task.path),
                    _ => hasher::hash_full(&task.path, cancel),
                };
                computed.map(|hash| (hash, true))
            }
        };

        let send = outcome_tx.send(HashOutcome {
            path: task.path,
            size: task.size,
            mtime: task.mtime,
            kind: task.kind,
            result,
        });
        if send.is_err() {
            return;
        }
    }
}

fn absorb_outcome(
    ctx: &PipelineContext<'_>,
    outcome: HashOutcome,
    output: &mut HashPassOutput,
    cache_batch: &mut Vec<FingerprintRow>,
    session_batch: &mut Vec<SessionHashRow>,
) -> StoreResult<()> {
    match outcome.result {
        Ok((hash, newly_computed)) => {
            let value = hash_to_hex(&hash);
            output
                .groups
                .entry((outcome.size, value.clone(), outcome.kind))
                .or_default()
                .push(outcome.path.clone());
            ctx.metrics.record_hashed();

            if newly_computed {
                cache_batch.push(FingerprintRow {
                    path: outcome.path.to_string_lossy().to_string(),
                    size: outcome.size,
                    mtime: outcome.mtime,
                    partial: (outcome.kind == HashKind::Partial).then_some(hash),
                    full: (outcome.kind == HashKind::Full).then_some(hash),
                });
            }
            session_batch.push(SessionHashRow {
                path: outcome.path.to_string_lossy().to_string(),
                size: outcome.size,
                mtime: outcome.mtime,
                kind: outcome.kind,
                value,
            });
        }
        Err(e) => ctx.metrics.record_hash_error(&e),
    }
    Ok(())
}

fn flush_if_due(
    ctx: &PipelineContext<'_>,
    cache_batch: &mut Vec<FingerprintRow>,
    session_batch: &mut Vec<SessionHashRow>,
) -> StoreResult<()> {
    if cache_batch.len() >= CACHE_FLUSH {
        flush_cache(ctx, cache_batch)?;
    }
    if session_batch.len() >= SESSION_FLUSH {
        flush_session(ctx, session_batch)?;
    }
    Ok(())
}

fn flush_cache(ctx: &PipelineContext<'_>, batch: &mut Vec<FingerprintRow>) -> StoreResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let cache = FingerprintStore::new(ctx.store)?;
    cache.apply_batch(batch)?;
    batch.clear();
    Ok(())
}

fn flush_session(ctx: &PipelineContext<'_>, batch: &mut Vec<SessionHashRow>) -> StoreResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    ctx.sessions.save_hashes_batch(ctx.session_id, batch)?;
    batch.clear();
    Ok(())
}
