//! Similar-image stage: pooled pHash computation and clustering.
//!
//! Image candidates are pulled from the collected file set by extension.
//! Each image gets a 64-bit pHash, served from the session's `PHASH`
//! rows when the `(size, mtime)` witness matches and computed by a
//! bounded worker pool otherwise. Clusters come from the BK-tree +
//! union-find engine in [`crate::scanner::perceptual`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use image_hasher::ImageHash;

use super::{GroupKey, ScanMetrics};
use crate::scanner::perceptual::{
    cluster_similar, is_image_path, radius_for_similarity, PerceptualHasher,
};
use crate::scanner::FileRecord;
use crate::store::{HashKind, SessionHashRow, SessionId, SessionStore, StoreResult};

/// Work chunk per pool round.
const CHUNK_PER_WORKER: usize = 8;

/// Inputs for one similar-image stage run.
pub struct SimilarStage<'a> {
    /// Session store view on the orchestrator thread.
    pub sessions: &'a SessionStore,
    /// Session being built.
    pub session_id: SessionId,
    /// Completed baseline session whose pHashes may seed this run.
    pub seed_session: Option<SessionId>,
    /// User similarity threshold in (0.0, 1.0].
    pub similarity: f64,
    /// Telemetry counters.
    pub metrics: &'a ScanMetrics,
    /// Shared cancel flag.
    pub cancel: &'a AtomicBool,
    /// Worker-pool size.
    pub workers: usize,
}

impl SimilarStage<'_> {
    /// Run the stage over the collected files.
    ///
    /// Returns `Ok(None)` when cancelled; otherwise `similar:<cluster>`
    /// groups of two or more images.
    ///
    /// # Errors
    ///
    /// Only storage failures escape; undecodable images count toward
    /// telemetry and drop out of clustering.
    pub fn run(
        &self,
        files: &[FileRecord],
        mut on_progress: impl FnMut(usize, usize),
    ) -> StoreResult<Option<BTreeMap<String, Vec<String>>>> {
        let images: Vec<&FileRecord> = files.iter().filter(|f| is_image_path(&f.path)).collect();
        if images.len() < 2 {
            return Ok(Some(BTreeMap::new()));
        }

        let paths: Vec<String> = images
            .iter()
            .map(|f| f.path.to_string_lossy().to_string())
            .collect();
        let session_phashes =
            self.sessions
                .load_hashes_for_paths(self.session_id, &paths, HashKind::Phash)?;
        let seed_phashes = match self.seed_session {
            Some(seed) if seed != self.session_id => {
                self.sessions
                    .load_hashes_for_paths(seed, &paths, HashKind::Phash)?
            }
            _ => Default::default(),
        };

        let mut hashed: Vec<(PathBuf, ImageHash)> = Vec::with_capacity(images.len());
        let mut to_compute: Vec<&FileRecord> = Vec::new();
        let mut batch: Vec<SessionHashRow> = Vec::new();

        for (record, path_key) in images.iter().zip(&paths) {
            let cached = session_phashes
                .get(path_key)
                .or_else(|| seed_phashes.get(path_key))
                .filter(|(_, size, mtime)| *size == record.size && *mtime == record.mtime)
                .and_then(|(value, _, _)| ImageHash::from_base64(value).ok());

            match cached {
                Some(hash) => {
                    batch.push(SessionHashRow {
                        path: path_key.clone(),
                        size: record.size,
                        mtime: record.mtime,
                        kind: HashKind::Phash,
                        value: hash.to_base64(),
                    });
                    hashed.push((record.path.clone(), hash));
                    self.metrics.record_hashed();
                }
                None => to_compute.push(*record),
            }
        }

        let total = images.len();
        let mut processed = hashed.len();
        on_progress(processed, total);

        let workers = self.workers.max(1);
        let chunk_size = workers * CHUNK_PER_WORKER;
        for chunk in to_compute.chunks(chunk_size) {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }

            let results: Mutex<Vec<(usize, Result<ImageHash, String>)>> =
                Mutex::new(Vec::with_capacity(chunk.len()));
            let next = AtomicUsize::new(0);

            std::thread::scope(|scope| {
                for _ in 0..workers.min(chunk.len()) {
                    scope.spawn(|| {
                        let hasher = PerceptualHasher::new();
                        loop {
                            if self.cancel.load(Ordering::SeqCst) {
                                return;
                            }
                            let idx = next.fetch_add(1, Ordering::Relaxed);
                            if idx >= chunk.len() {
                                return;
                            }
                            let record = chunk[idx];
                            let outcome = hasher
                                .compute_hash(&record.path)
                                .map_err(|e| e.to_string());
                            results.lock().unwrap().push((idx, outcome));
                        }
                    });
                }
            });

            for (idx, outcome) in results.into_inner().unwrap() {
                let record = chunk[idx];
                match outcome {
                    Ok(hash) => {
                        batch.push(SessionHashRow {
                            path: record.path.to_string_lossy().to_string(),
                            size: record.size,
                            mtime: record.mtime,
                            kind: HashKind::Phash,
                            value: hash.to_base64(),
                        });
                        hashed.push((record.path.clone(), hash));
                        self.metrics.record_hashed();
                    }
                    Err(message) => self.metrics.record_other_error(&message),
                }
                processed += 1;
            }
            on_progress(processed.min(total), total);
        }

        self.sessions.save_hashes_batch(self.session_id, &batch)?;

        if self.cancel.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let radius = radius_for_similarity(self.similarity);
        let Some(clusters) = cluster_similar(&hashed, radius, self.cancel, |_, _| {}) else {
            return Ok(None);
        };

        let size_of: std::collections::HashMap<&std::path::Path, u64> = files
            .iter()
            .map(|f| (f.path.as_path(), f.size))
            .collect();

        let mut out = BTreeMap::new();
        for (cluster_idx, members) in clusters.into_iter().enumerate() {
            let representative_size = members
                .first()
                .and_then(|p| size_of.get(p.as_path()).copied())
                .unwrap_or(0);
            let key = GroupKey::SimilarImage {
                cluster: cluster_idx as u64,
                size: representative_size,
            }
            .encode();
            let mut members: Vec<String> = members
                .into_iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect();
            members.sort();
            out.insert(key, members);
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        _store: Arc<Store>,
        sessions: SessionStore,
        session_id: SessionId,
        data: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("cache.db")).unwrap();
        let sessions = SessionStore::new(&store).unwrap();
        let session_id = sessions.create_session("{}", "h").unwrap();
        let data = dir.path().join("images");
        std::fs::create_dir(&data).unwrap();
        Fixture {
            _dir: dir,
            _store: store,
            sessions,
            session_id,
            data,
        }
    }

    fn gradient_image(width: u32, height: u32) -> image::RgbImage {
        let mut img = image::RgbImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let fx = (x * 255 / width.max(1)) as u8;
            let fy = (y * 255 / height.max(1)) as u8;
            *pixel = image::Rgb([fx, fy, 128]);
        }
        img
    }

    fn checker_image(width: u32, height: u32) -> image::RgbImage {
        let mut img = image::RgbImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = if (x / 4 + y / 4) % 2 == 0 { 255 } else { 0 };
            *pixel = image::Rgb([v, v, v]);
        }
        img
    }

    fn save_record(path: &PathBuf, img: &image::RgbImage) -> FileRecord {
        img.save(path).unwrap();
        let metadata = std::fs::metadata(path).unwrap();
        FileRecord::from_metadata(path.clone(), &metadata)
    }

    fn stage<'a>(
        fx: &'a Fixture,
        metrics: &'a ScanMetrics,
        cancel: &'a AtomicBool,
        similarity: f64,
    ) -> SimilarStage<'a> {
        SimilarStage {
            sessions: &fx.sessions,
            session_id: fx.session_id,
            seed_session: None,
            similarity,
            metrics,
            cancel,
            workers: 2,
        }
    }

    #[test]
    fn test_same_scene_clusters_apart_from_unrelated() {
        let fx = fixture();
        // The same scene rendered at different resolutions, plus one
        // unrelated image.
        let scene = gradient_image(64, 64);
        let scene_small = gradient_image(32, 32);
        let unrelated = checker_image(64, 64);

        let files = vec![
            save_record(&fx.data.join("scene_a.png"), &scene),
            save_record(&fx.data.join("scene_b.png"), &scene_small),
            save_record(&fx.data.join("noise.png"), &unrelated),
        ];

        let metrics = ScanMetrics::new();
        let cancel = AtomicBool::new(false);
        let groups = stage(&fx, &metrics, &cancel, 0.9)
            .run(&files, |_, _| {})
            .unwrap()
            .unwrap();

        assert_eq!(groups.len(), 1);
        let members = groups.values().next().unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|p| p.contains("scene")));
    }

    #[test]
    fn test_fewer_than_two_images_is_empty() {
        let fx = fixture();
        let files = vec![save_record(
            &fx.data.join("only.png"),
            &gradient_image(16, 16),
        )];

        let metrics = ScanMetrics::new();
        let cancel = AtomicBool::new(false);
        let groups = stage(&fx, &metrics, &cancel, 0.9)
            .run(&files, |_, _| {})
            .unwrap()
            .unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_undecodable_image_counts_toward_telemetry() {
        let fx = fixture();
        let fake = fx.data.join("fake.jpg");
        std::fs::write(&fake, b"definitely not a jpeg").unwrap();
        let fake_record =
            FileRecord::from_metadata(fake.clone(), &std::fs::metadata(&fake).unwrap());

        let files = vec![
            save_record(&fx.data.join("real_a.png"), &gradient_image(32, 32)),
            save_record(&fx.data.join("real_b.png"), &gradient_image(32, 32)),
            fake_record,
        ];

        let metrics = ScanMetrics::new();
        let cancel = AtomicBool::new(false);
        let groups = stage(&fx, &metrics, &cancel, 0.9)
            .run(&files, |_, _| {})
            .unwrap()
            .unwrap();

        assert_eq!(groups.len(), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.files_skipped_error, 1);
        assert_eq!(snapshot.errors_total, 1);
    }

    #[test]
    fn test_phashes_cached_in_session() {
        let fx = fixture();
        let files = vec![
            save_record(&fx.data.join("a.png"), &gradient_image(32, 32)),
            save_record(&fx.data.join("b.png"), &gradient_image(32, 32)),
        ];
        let paths: Vec<String> = files
            .iter()
            .map(|f| f.path.to_string_lossy().to_string())
            .collect();

        let metrics = ScanMetrics::new();
        let cancel = AtomicBool::new(false);
        stage(&fx, &metrics, &cancel, 0.9)
            .run(&files, |_, _| {})
            .unwrap()
            .unwrap();

        let rows = fx
            .sessions
            .load_hashes_for_paths(fx.session_id, &paths, HashKind::Phash)
            .unwrap();
        assert_eq!(rows.len(), 2);

        // A second run replays from the session rows.
        let groups = stage(&fx, &metrics, &cancel, 0.9)
            .run(&files, |_, _| {})
            .unwrap()
            .unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_cancel_returns_none() {
        let fx = fixture();
        let files = vec![
            save_record(&fx.data.join("a.png"), &gradient_image(16, 16)),
            save_record(&fx.data.join("b.png"), &gradient_image(16, 16)),
        ];

        let metrics = ScanMetrics::new();
        let cancel = AtomicBool::new(true);
        let result = stage(&fx, &metrics, &cancel, 0.9)
            .run(&files, |_, _| {})
            .unwrap();
        assert!(result.is_none());
    }
}
