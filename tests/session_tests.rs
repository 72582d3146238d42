//! Session lifecycle tests: cancellation, pause, resume, export.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use dupescan::duplicates::{DuplicateFinder, ScanCompletion, ScanReport};
use dupescan::output::{load_results, ExportDocument};
use dupescan::progress::ScanObserver;
use dupescan::store::{ScanStage, SessionStatus, SessionStore, Store};
use dupescan::ScanConfig;

fn write(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

fn open_store(dir: &TempDir) -> Arc<Store> {
    Store::open(&dir.path().join("scan_cache.db")).unwrap()
}

fn config_for(root: &Path) -> ScanConfig {
    let mut config = ScanConfig::new(vec![root.to_path_buf()]);
    config.protect_system = false;
    config.max_workers = 2;
    config
}

fn run_finished(config: ScanConfig, store: &Arc<Store>) -> ScanReport {
    let finder = DuplicateFinder::new(config, Arc::clone(store)).unwrap();
    match finder.run() {
        ScanCompletion::Finished(report) => *report,
        other => panic!("expected Finished, got {other:?}"),
    }
}

/// Raises the cancel flag the moment the pipeline enters a given stage.
struct CancelAtStage {
    stage: ScanStage,
    flag: Arc<AtomicBool>,
}

impl ScanObserver for CancelAtStage {
    fn on_stage_change(&self, stage: ScanStage) {
        if stage == self.stage {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Populate `pairs` duplicate pairs plus one unique file.
fn populate_pairs(data: &Path, pairs: usize) {
    for i in 0..pairs {
        let body = format!("pair number {i} shared content payload");
        write(data, &format!("pair_{i}_a.bin"), body.as_bytes());
        write(data, &format!("pair_{i}_b.bin"), body.as_bytes());
    }
    write(data, "unique.bin", b"nothing else looks like this");
}

#[test]
fn cancel_before_collect_pauses_at_collect() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("A");
    std::fs::create_dir(&data).unwrap();
    populate_pairs(&data, 3);

    let store = open_store(&dir);
    let cancel = Arc::new(AtomicBool::new(true));
    let finder = DuplicateFinder::new(config_for(&data), Arc::clone(&store))
        .unwrap()
        .with_cancel_flag(cancel);

    match finder.run() {
        ScanCompletion::Cancelled { session, stage } => {
            assert_eq!(stage, ScanStage::Collect);
            let sessions = SessionStore::new(&store).unwrap();
            let record = sessions.get_session(session).unwrap().unwrap();
            assert_eq!(record.status, SessionStatus::Paused);
            assert_eq!(record.stage, ScanStage::Collect);
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

#[test]
fn cancel_at_full_hash_then_resume_completes() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("A");
    std::fs::create_dir(&data).unwrap();
    populate_pairs(&data, 20);

    let store = open_store(&dir);
    let config = config_for(&data);

    // First attempt: the flag rises as the full-hash stage begins.
    let cancel = Arc::new(AtomicBool::new(false));
    let observer = Arc::new(CancelAtStage {
        stage: ScanStage::FullHash,
        flag: Arc::clone(&cancel),
    });
    let finder = DuplicateFinder::new(config.clone(), Arc::clone(&store))
        .unwrap()
        .with_cancel_flag(Arc::clone(&cancel))
        .with_observer(observer);

    let paused_session = match finder.run() {
        ScanCompletion::Cancelled { session, stage } => {
            assert_eq!(stage, ScanStage::FullHash);
            let sessions = SessionStore::new(&store).unwrap();
            let record = sessions.get_session(session).unwrap().unwrap();
            assert_eq!(record.status, SessionStatus::Paused);
            assert_eq!(record.stage, ScanStage::FullHash);
            session
        }
        other => panic!("expected Cancelled, got {other:?}"),
    };

    // Second attempt with the same config resumes the paused session
    // and runs to completion.
    let report = run_finished(config, &store);
    assert_eq!(report.session, paused_session);
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.results.len(), 20);
    for members in report.results.values() {
        assert_eq!(members.len(), 2);
    }
}

#[test]
fn resumed_scan_matches_uninterrupted_scan() {
    let source = TempDir::new().unwrap();
    let data = source.path().join("A");
    std::fs::create_dir(&data).unwrap();
    populate_pairs(&data, 8);

    // Control: uninterrupted scan on its own store.
    let control_dir = TempDir::new().unwrap();
    let control_store = open_store(&control_dir);
    let control = run_finished(config_for(&data), &control_store);

    // Interrupted-then-resumed scan on a separate store.
    let resumed_dir = TempDir::new().unwrap();
    let resumed_store = open_store(&resumed_dir);
    let cancel = Arc::new(AtomicBool::new(false));
    let observer = Arc::new(CancelAtStage {
        stage: ScanStage::FullHash,
        flag: Arc::clone(&cancel),
    });
    let finder = DuplicateFinder::new(config_for(&data), Arc::clone(&resumed_store))
        .unwrap()
        .with_cancel_flag(Arc::clone(&cancel))
        .with_observer(observer);
    assert!(matches!(finder.run(), ScanCompletion::Cancelled { .. }));

    let resumed = run_finished(config_for(&data), &resumed_store);

    assert_eq!(control.results, resumed.results);
}

#[test]
fn completed_sessions_are_not_resumed() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("A");
    std::fs::create_dir(&data).unwrap();
    populate_pairs(&data, 2);

    let store = open_store(&dir);
    let first = run_finished(config_for(&data), &store);
    let second = run_finished(config_for(&data), &store);

    assert_ne!(first.session, second.session);
    assert_eq!(first.results, second.results);
}

#[test]
fn resume_survives_deleted_files() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("A");
    std::fs::create_dir(&data).unwrap();
    populate_pairs(&data, 4);
    let doomed_a = data.join("pair_0_a.bin");
    let doomed_b = data.join("pair_0_b.bin");

    let store = open_store(&dir);
    let config = config_for(&data);

    let cancel = Arc::new(AtomicBool::new(false));
    let observer = Arc::new(CancelAtStage {
        stage: ScanStage::QuickHash,
        flag: Arc::clone(&cancel),
    });
    let finder = DuplicateFinder::new(config.clone(), Arc::clone(&store))
        .unwrap()
        .with_cancel_flag(Arc::clone(&cancel))
        .with_observer(observer);
    assert!(matches!(finder.run(), ScanCompletion::Cancelled { .. }));

    // One pair vanishes while the session is paused.
    std::fs::remove_file(&doomed_a).unwrap();
    std::fs::remove_file(&doomed_b).unwrap();

    let report = run_finished(config, &store);
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.results.len(), 3);
    assert!(report
        .results
        .values()
        .flatten()
        .all(|m| !m.contains("pair_0")));
}

#[test]
fn export_and_reload_results() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("A");
    std::fs::create_dir(&data).unwrap();
    populate_pairs(&data, 2);

    let store = open_store(&dir);
    let report = run_finished(config_for(&data), &store);

    let out_path = dir.path().join("results.json");
    ExportDocument::from_report(&report)
        .write_to(&out_path)
        .unwrap();

    let payload = std::fs::read_to_string(&out_path).unwrap();
    let loaded = load_results(&payload).unwrap();

    let meta = loaded.meta.unwrap();
    assert_eq!(meta.scan_status, "completed");
    assert_eq!(meta.config_hash, report.config_hash);
    assert_eq!(meta.session_id, report.session.to_string());
    assert_eq!(loaded.results, report.results);
}

#[test]
fn different_config_does_not_resume_foreign_session() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("A");
    std::fs::create_dir(&data).unwrap();
    populate_pairs(&data, 2);

    let store = open_store(&dir);

    // Pause a session with one config.
    let cancel = Arc::new(AtomicBool::new(true));
    let finder = DuplicateFinder::new(config_for(&data), Arc::clone(&store))
        .unwrap()
        .with_cancel_flag(cancel);
    let paused = match finder.run() {
        ScanCompletion::Cancelled { session, .. } => session,
        other => panic!("expected Cancelled, got {other:?}"),
    };

    // A config with different semantics creates a fresh session.
    let mut other_config = config_for(&data);
    other_config.min_size = 4;
    let report = run_finished(other_config, &store);
    assert_ne!(report.session, paused);

    // The paused session is still there for its own config.
    let sessions = SessionStore::new(&store).unwrap();
    let record = sessions.get_session(paused).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Paused);
}

#[test]
fn session_gc_respects_keep_latest() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("A");
    std::fs::create_dir(&data).unwrap();
    populate_pairs(&data, 1);

    let store = open_store(&dir);
    let mut config = config_for(&data);
    config.keep_sessions = 2;

    let first = run_finished(config.clone(), &store);
    let _second = run_finished(config.clone(), &store);
    let third = run_finished(config.clone(), &store);
    let fourth = run_finished(config.clone(), &store);

    // GC runs at scan startup: by the time the fourth session is
    // created, only the latest two earlier sessions survived.
    let sessions = SessionStore::new(&store).unwrap();
    assert!(sessions.get_session(first.session).unwrap().is_none());
    assert!(sessions.get_session(third.session).unwrap().is_some());
    assert!(sessions.get_session(fourth.session).unwrap().is_some());
}
