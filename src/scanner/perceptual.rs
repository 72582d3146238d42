//! Perceptual image hashing and similarity clustering.
//!
//! Near-duplicate images are found without pairwise comparison: each
//! candidate gets a 64-bit DCT-based pHash, the hashes go into a BK-tree
//! keyed by Hamming distance for sublinear radius queries, and a
//! union-find structure accumulates transitive similarity into clusters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bk_tree::{BKTree, Metric};
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use thiserror::Error;

/// Width of the perceptual hash in bits.
pub const PHASH_BITS: u32 = 64;

/// File extensions considered image candidates.
pub const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tiff", "tif"];

/// Whether a path has an image extension.
#[must_use]
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

/// Map a user similarity in (0.0, 1.0] to a Hamming search radius.
///
/// 1.0 requires an exact pHash match; lower values widen the radius
/// proportionally across the 64-bit hash.
#[must_use]
pub fn radius_for_similarity(similarity: f64) -> u32 {
    ((1.0 - similarity) * f64::from(PHASH_BITS)).round() as u32
}

/// Errors that can occur during perceptual hashing.
#[derive(Debug, Error)]
pub enum PerceptualError {
    /// Failed to open or decode the image.
    #[error("Failed to load image {0}: {1}")]
    Load(String, #[source] image::ImageError),
}

/// Computes 64-bit DCT pHashes for images.
pub struct PerceptualHasher {
    hasher: image_hasher::Hasher,
}

impl PerceptualHasher {
    /// Create a hasher producing 64-bit DCT-based hashes from a
    /// downscaled grayscale projection.
    #[must_use]
    pub fn new() -> Self {
        let config = HasherConfig::new()
            .hash_size(8, 8)
            .hash_alg(HashAlg::Median)
            .preproc_dct();
        Self {
            hasher: config.to_hasher(),
        }
    }

    /// Compute the perceptual hash for an image at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`PerceptualError::Load`] when the file cannot be opened
    /// or decoded as an image.
    pub fn compute_hash<P: AsRef<Path>>(&self, path: P) -> Result<ImageHash, PerceptualError> {
        let path = path.as_ref();
        let img = image::open(path)
            .map_err(|e| PerceptualError::Load(path.display().to_string(), e))?;
        Ok(self.hasher.hash_image(&img))
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Metric comparing [`ImageHash`] values by Hamming distance.
#[derive(Default, Clone, Copy, Debug)]
pub struct ImageHashMetric;

impl Metric<ImageHash> for ImageHashMetric {
    fn distance(&self, a: &ImageHash, b: &ImageHash) -> u32 {
        a.dist(b)
    }

    fn threshold_distance(&self, a: &ImageHash, b: &ImageHash, threshold: u32) -> Option<u32> {
        let d = self.distance(a, b);
        if d <= threshold {
            Some(d)
        } else {
            None
        }
    }
}

/// Similarity index over perceptual hashes using a BK-tree.
pub struct SimilarityIndex {
    tree: BKTree<ImageHash, ImageHashMetric>,
    count: usize,
}

impl SimilarityIndex {
    /// Create a new empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: BKTree::new(ImageHashMetric),
            count: 0,
        }
    }

    /// Add an image hash to the index.
    pub fn insert(&mut self, hash: ImageHash) {
        self.tree.add(hash);
        self.count += 1;
    }

    /// Find all hashes within the given Hamming distance.
    pub fn find(&self, hash: &ImageHash, max_distance: u32) -> Vec<(u32, &ImageHash)> {
        self.tree.find(hash, max_distance).collect()
    }

    /// Number of hashes in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Disjoint-set structure with path compression.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Cluster hashed images by transitive similarity.
///
/// Any two hashes within `radius` Hamming distance join the same cluster;
/// only clusters with two or more member paths are returned. Returns
/// `None` when cancelled mid-clustering.
pub fn cluster_similar(
    hashed: &[(PathBuf, ImageHash)],
    radius: u32,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(usize, usize),
) -> Option<Vec<Vec<PathBuf>>> {
    if hashed.is_empty() {
        return Some(Vec::new());
    }

    // Exact-duplicate hashes collapse to one tree node; remember every
    // path behind each distinct hash value.
    let mut paths_by_hash: HashMap<Vec<u8>, Vec<&PathBuf>> = HashMap::new();
    let mut unique: Vec<&ImageHash> = Vec::new();
    let mut index_by_hash: HashMap<Vec<u8>, usize> = HashMap::new();

    for (path, hash) in hashed {
        let bytes = hash.as_bytes().to_vec();
        paths_by_hash.entry(bytes.clone()).or_default().push(path);
        if !index_by_hash.contains_key(&bytes) {
            index_by_hash.insert(bytes, unique.len());
            unique.push(hash);
        }
    }

    let mut index = SimilarityIndex::new();
    for hash in &unique {
        if cancel.load(Ordering::SeqCst) {
            return None;
        }
        index.insert((*hash).clone());
    }

    let total = unique.len();
    let mut uf = UnionFind::new(total);
    for (i, hash) in unique.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            return None;
        }
        for (_, neighbor) in index.find(hash, radius) {
            let j = index_by_hash[&neighbor.as_bytes().to_vec()];
            if i != j {
                uf.union(i, j);
            }
        }
        if (i + 1) % 10 == 0 || i + 1 == total {
            on_progress(i + 1, total);
        }
    }

    let mut clusters: HashMap<usize, Vec<PathBuf>> = HashMap::new();
    for (i, hash) in unique.iter().enumerate() {
        let root = uf.find(i);
        let members = clusters.entry(root).or_default();
        for path in &paths_by_hash[&hash.as_bytes().to_vec()] {
            members.push((*path).clone());
        }
    }

    let mut out: Vec<Vec<PathBuf>> = clusters
        .into_values()
        .filter(|members| members.len() >= 2)
        .collect();
    for members in &mut out {
        members.sort();
    }
    out.sort_by(|a, b| a.first().cmp(&b.first()));
    Some(out)
}
