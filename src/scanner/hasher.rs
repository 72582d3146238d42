//! BLAKE3 content hashing with streaming support.
//!
//! Two digests are computed per candidate file: a partial hash over the
//! first 64 KiB, cheap enough to discard most same-size collisions, and a
//! full hash over the entire content streamed through a 1 MiB buffer.
//! Both are truncated to 128 bits; with the two-phase size/partial
//! pre-partitioning that strength is far past any realistic collision
//! budget for a local filesystem.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::HashError;

/// Size of the file prefix covered by the partial hash.
pub const PARTIAL_HASH_SIZE: u64 = 64 * 1024;

/// Read buffer size for full hashing and byte comparison.
pub const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// A 128-bit content digest (truncated BLAKE3).
pub type Hash = [u8; 16];

/// Convert a hash to its lowercase hex representation.
#[must_use]
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut out = String::with_capacity(hash.len() * 2);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Parse a lowercase hex string back into a hash.
///
/// Returns `None` when the input is not exactly 32 hex characters.
#[must_use]
pub fn hex_to_hash(hex: &str) -> Option<Hash> {
    if hex.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(out)
}

/// Compute the partial hash: a digest over the first 64 KiB of the file.
///
/// # Errors
///
/// Returns a classified [`HashError`] on any I/O failure.
pub fn hash_partial(path: &Path) -> Result<Hash, HashError> {
    let mut file = open_classified(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; PARTIAL_HASH_SIZE as usize];
    let mut remaining = PARTIAL_HASH_SIZE as usize;

    while remaining > 0 {
        let n = file
            .read(&mut buf[..remaining])
            .map_err(|e| classify_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n;
    }

    Ok(truncate_digest(hasher))
}

/// Compute the full hash over the entire content, streaming with a 1 MiB
/// buffer. Checks the cancel flag between reads so a long file does not
/// pin a worker after cancellation.
///
/// # Errors
///
/// Returns [`HashError::Interrupted`] when cancelled mid-file, or a
/// classified I/O error.
pub fn hash_full(path: &Path, cancel: &AtomicBool) -> Result<Hash, HashError> {
    let mut file = open_classified(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(HashError::Interrupted(path.to_path_buf()));
        }
        let n = file.read(&mut buf).map_err(|e| classify_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(truncate_digest(hasher))
}

/// Compare two files byte-by-byte with 1 MiB buffers.
///
/// # Errors
///
/// Returns [`HashError::Interrupted`] when cancelled, or a classified
/// I/O error from either file.
pub fn bytes_equal(a: &Path, b: &Path, cancel: &AtomicBool) -> Result<bool, HashError> {
    let mut fa = open_classified(a)?;
    let mut fb = open_classified(b)?;
    let mut buf_a = vec![0u8; READ_BUFFER_SIZE];
    let mut buf_b = vec![0u8; READ_BUFFER_SIZE];

    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(HashError::Interrupted(a.to_path_buf()));
        }
        let na = read_fully(&mut fa, &mut buf_a).map_err(|e| classify_io(a, e))?;
        let nb = read_fully(&mut fb, &mut buf_b).map_err(|e| classify_io(b, e))?;
        if na != nb || buf_a[..na] != buf_b[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

/// Fill the buffer as far as possible; returns bytes read (0 on EOF).
fn read_fully(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn truncate_digest(hasher: blake3::Hasher) -> Hash {
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.as_bytes()[..16]);
    out
}

fn open_classified(path: &Path) -> Result<File, HashError> {
    File::open(path).map_err(|e| classify_io(path, e))
}

/// Classify an I/O error into the telemetry taxonomy.
fn classify_io(path: &Path, error: std::io::Error) -> HashError {
    if is_sharing_violation(&error) {
        return HashError::Locked(path.to_path_buf());
    }
    match error.kind() {
        ErrorKind::NotFound => HashError::NotFound(path.to_path_buf()),
        ErrorKind::PermissionDenied => HashError::PermissionDenied(path.to_path_buf()),
        _ => HashError::Io {
            path: path.to_path_buf(),
            source: error,
        },
    }
}

/// Whether the OS reported an exclusive lock / sharing violation.
fn is_sharing_violation(error: &std::io::Error) -> bool {
    if error.kind() == ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
        if matches!(error.raw_os_error(), Some(32) | Some(33)) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_hash_hex_round_trip() {
        let hash: Hash = [
            0xab, 0xcd, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb,
            0xcc, 0xdd,
        ];
        let hex = hash_to_hex(&hash);
        assert_eq!(hex.len(), 32);
        assert!(hex.starts_with("abcd"));
        assert_eq!(hex_to_hash(&hex), Some(hash));
    }

    #[test]
    fn test_hex_to_hash_rejects_bad_input() {
        assert_eq!(hex_to_hash("abc"), None);
        assert_eq!(hex_to_hash(&"zz".repeat(16)), None);
    }

    #[test]
    fn test_identical_content_same_hash() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "a.bin", b"hello world");
        let b = write_file(&dir, "b.bin", b"hello world");
        let c = write_file(&dir, "c.bin", b"hello wOrld");

        let cancel = no_cancel();
        assert_eq!(
            hash_full(&a, &cancel).unwrap(),
            hash_full(&b, &cancel).unwrap()
        );
        assert_ne!(
            hash_full(&a, &cancel).unwrap(),
            hash_full(&c, &cancel).unwrap()
        );
    }

    #[test]
    fn test_partial_hash_covers_prefix_only() {
        let dir = TempDir::new().unwrap();
        let mut prefix = vec![7u8; PARTIAL_HASH_SIZE as usize];
        let mut a_content = prefix.clone();
        a_content.extend_from_slice(b"tail A");
        let mut b_content = std::mem::take(&mut prefix);
        b_content.extend_from_slice(b"tail B different");

        let a = write_file(&dir, "a.bin", &a_content);
        let b = write_file(&dir, "b.bin", &b_content);

        // Same first 64 KiB, different tails: partial hashes collide,
        // full hashes do not.
        let cancel = no_cancel();
        assert_eq!(hash_partial(&a).unwrap(), hash_partial(&b).unwrap());
        assert_ne!(
            hash_full(&a, &cancel).unwrap(),
            hash_full(&b, &cancel).unwrap()
        );
    }

    #[test]
    fn test_partial_hash_of_small_file_matches_whole_prefix() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "small.bin", b"tiny");
        let b = write_file(&dir, "small2.bin", b"tiny");
        assert_eq!(hash_partial(&a).unwrap(), hash_partial(&b).unwrap());
    }

    #[test]
    fn test_missing_file_classified() {
        let err = hash_partial(Path::new("/nonexistent/xyz.bin")).unwrap_err();
        assert!(matches!(err, HashError::NotFound(_)));
    }

    #[test]
    fn test_full_hash_interrupted_by_cancel() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "a.bin", &vec![1u8; 4096]);
        let cancel = AtomicBool::new(true);
        let err = hash_full(&a, &cancel).unwrap_err();
        assert!(matches!(err, HashError::Interrupted(_)));
    }

    #[test]
    fn test_bytes_equal() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "a.bin", b"identical content");
        let b = write_file(&dir, "b.bin", b"identical content");
        let c = write_file(&dir, "c.bin", b"identical CONTENT");
        let d = write_file(&dir, "d.bin", b"identical");

        let cancel = no_cancel();
        assert!(bytes_equal(&a, &b, &cancel).unwrap());
        assert!(!bytes_equal(&a, &c, &cancel).unwrap());
        assert!(!bytes_equal(&a, &d, &cancel).unwrap());
    }
}
