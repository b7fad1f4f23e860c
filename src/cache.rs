//! Compression cache - content-hash keyed results.
//!
//! UPX compression is slow; compressing the same binary twice across
//! runs is pure waste. Each cache entry is the compressed output stored
//! under the SHA256 of the *uncompressed* input, so two workers (or two
//! runs) never redo the same work. Insertion is write-to-temp plus
//! rename, which doubles as the per-file lock. Entries untouched for
//! longer than the retention window are evicted opportunistically at
//! the end of a run.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Entries older than this are evicted at end of run.
pub const RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// On-disk cache of compressed binaries.
pub struct CompressionCache {
    dir: PathBuf,
}

impl CompressionCache {
    pub fn open(base_dir: &Path) -> Result<Self> {
        let dir = base_dir.join("compressed");
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create cache dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Content hash of a file. None if it cannot be read; the caller
    /// then compresses without the cache.
    pub fn key_for(path: &Path) -> Option<String> {
        match fs::read(path) {
            Ok(content) => {
                let mut hasher = Sha256::new();
                hasher.update(&content);
                Some(format!("{:x}", hasher.finalize()))
            }
            Err(e) => {
                eprintln!(
                    "  [WARN] Failed to read {} for hashing: {} (cache skipped)",
                    path.display(),
                    e
                );
                None
            }
        }
    }

    /// Copy a cached compressed result over `dest`. Returns false on a
    /// cache miss. A hit refreshes the entry's mtime so hot entries
    /// survive eviction.
    pub fn fetch(&self, key: &str, dest: &Path) -> Result<bool> {
        let entry = self.dir.join(key);
        if !entry.is_file() {
            return Ok(false);
        }
        fs::copy(&entry, dest)
            .with_context(|| format!("cannot restore cached copy of {}", dest.display()))?;
        let now = fs::OpenOptions::new().append(true).open(&entry);
        if let Ok(file) = now {
            let _ = file.set_modified(SystemTime::now());
        }
        Ok(true)
    }

    /// Insert a compressed file under its key. Atomic: a concurrent
    /// insert of the same key wins harmlessly (identical content).
    pub fn store(&self, key: &str, compressed: &Path) -> Result<()> {
        let tmp = self
            .dir
            .join(format!(".{key}.{:08x}.tmp", rand::random::<u32>()));
        fs::copy(compressed, &tmp)
            .with_context(|| format!("cannot stage cache entry for {}", compressed.display()))?;
        fs::rename(&tmp, self.dir.join(key))?;
        Ok(())
    }

    /// Drop entries older than the retention window. Best effort;
    /// failures are ignored.
    pub fn evict_stale(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if now
                .duration_since(modified)
                .map(|age| age > RETENTION)
                .unwrap_or(false)
            {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_then_fetch_round_trip() {
        let tmp = TempDir::new().unwrap();
        let cache = CompressionCache::open(tmp.path()).unwrap();

        let original = tmp.path().join("binary.so");
        fs::write(&original, b"uncompressed bytes").unwrap();
        let key = CompressionCache::key_for(&original).unwrap();

        let compressed = tmp.path().join("binary.so.small");
        fs::write(&compressed, b"compressed").unwrap();
        cache.store(&key, &compressed).unwrap();

        let dest = tmp.path().join("restored.so");
        assert!(cache.fetch(&key, &dest).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), b"compressed");
    }

    #[test]
    fn miss_returns_false() {
        let tmp = TempDir::new().unwrap();
        let cache = CompressionCache::open(tmp.path()).unwrap();
        let dest = tmp.path().join("out");
        assert!(!cache.fetch("deadbeef", &dest).unwrap());
        assert!(!dest.exists());
    }

    #[test]
    fn same_content_same_key() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::write(&a, b"identical").unwrap();
        fs::write(&b, b"identical").unwrap();
        assert_eq!(
            CompressionCache::key_for(&a).unwrap(),
            CompressionCache::key_for(&b).unwrap()
        );
    }
}
