//! Disk-backed response cache
//!
//! Stores API responses on local disk to absorb rate limits and turn repeated
//! metadata lookups into local reads. Two expiry regimes:
//!
//! - Short entries expire a fixed delay after they were written.
//! - Long entries expire a (much longer) delay after they were last *read*:
//!   every hit resets their age, so data that keeps being used stays cached.
//!
//! Entries are named by a SHA-256 digest of the logical key plus a one
//! character mode suffix, so the two regimes never collide under the same
//! key. Payloads are gzip-compressed JSON. There is no cross-process locking;
//! concurrent writers to one key race and the last one wins, which is
//! acceptable for derived, reconstructable data.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::Config;

/// Cache lookup/store failure. Never surfaced outside the crate: callers of
/// the REST client only ever observe a refetch.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no cache entry")]
    Miss,

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Entry expiry regime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Fixed expiry from write time
    Short,
    /// Sliding expiry from last read
    Long,
}

impl CacheMode {
    /// On-disk filename suffix for this mode
    fn suffix(self) -> char {
        match self {
            CacheMode::Short => 's',
            CacheMode::Long => 'l',
        }
    }
}

/// Handle to the on-disk cache directory.
///
/// The constructor performs the directory setup (owner-only permissions), so
/// holding a handle is the proof that the cache is usable; there is no hidden
/// process-wide initialization state.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    dir: PathBuf,
    short_expiry: Duration,
    long_expiry: Duration,
}

impl CacheHandle {
    /// Create a handle from the configuration, creating the cache directory
    /// with mode 0700 if needed.
    pub fn new(config: &Config) -> std::io::Result<Self> {
        Self::with_dir(
            config.cache_dir.clone(),
            config.cache_short_expiry,
            config.cache_long_expiry,
        )
    }

    /// Create a handle over an explicit directory with explicit expiry
    /// windows.
    pub fn with_dir(
        dir: PathBuf,
        short_expiry: Duration,
        long_expiry: Duration,
    ) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        debug!(dir = %dir.display(), "cache directory ready");
        Ok(Self {
            dir,
            short_expiry,
            long_expiry,
        })
    }

    /// Get a cached value.
    ///
    /// Probes the short entry then the long entry for the key. An expired
    /// entry is deleted on the way through. A hit on a long entry resets its
    /// age to zero; short entries age regardless of use.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, CacheError> {
        let hashed = hash_key(key);

        for mode in [CacheMode::Short, CacheMode::Long] {
            let path = self.dir.join(entry_name(&hashed, mode));

            let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(_) => continue,
            };

            if self.is_expired(mtime, mode) {
                debug!(key = key, mode = ?mode, "cache entry expired, removing");
                let _ = fs::remove_file(&path);
                continue;
            }

            if mode == CacheMode::Long {
                // Sliding expiry: a hit resets the entry's age
                touch(&path);
            }

            debug!(key = key, mode = ?mode, "cache HIT");
            return read_entry(&path);
        }

        debug!(key = key, "cache MISS");
        Err(CacheError::Miss)
    }

    /// Store a value under the key in the given mode, replacing any previous
    /// entry for (key, mode).
    pub fn set<T: Serialize>(&self, key: &str, value: &T, mode: CacheMode) -> Result<(), CacheError> {
        let path = self.dir.join(entry_name(&hash_key(key), mode));

        // Write through a temp file so readers never observe a partial entry
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        {
            let mut encoder = GzEncoder::new(&mut tmp, Compression::default());
            serde_json::to_writer(&mut encoder, value)?;
            encoder.finish()?;
        }
        tmp.persist(&path).map_err(|e| CacheError::Io(e.error))?;

        debug!(key = key, mode = ?mode, path = %path.display(), "cache entry stored");
        Ok(())
    }

    /// Delete every entry past its mode's expiry, scanning the cache
    /// directory once. Returns the number of entries removed.
    pub fn sweep(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let mode = match name.to_string_lossy().chars().last() {
                Some('s') => CacheMode::Short,
                Some('l') => CacheMode::Long,
                _ => continue,
            };

            let mtime = match dir_entry.metadata().and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(_) => continue,
            };

            if self.is_expired(mtime, mode) {
                if let Err(e) = fs::remove_file(dir_entry.path()) {
                    warn!(path = %dir_entry.path().display(), error = %e, "failed to sweep cache entry");
                } else {
                    removed += 1;
                }
            }
        }
        debug!(removed = removed, "cache sweep done");
        Ok(removed)
    }

    fn is_expired(&self, mtime: SystemTime, mode: CacheMode) -> bool {
        let expiry = match mode {
            CacheMode::Short => self.short_expiry,
            CacheMode::Long => self.long_expiry,
        };
        match mtime.elapsed() {
            Ok(age) => age > expiry,
            // mtime in the future: clock skew, treat as fresh
            Err(_) => false,
        }
    }

    /// Cache directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Hash a logical cache key to its on-disk base name.
fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn entry_name(hashed: &str, mode: CacheMode) -> String {
    format!("{}{}", hashed, mode.suffix())
}

fn read_entry<T: DeserializeOwned>(path: &Path) -> Result<T, CacheError> {
    let file = fs::File::open(path)?;
    let mut decoder = GzDecoder::new(file);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Reset a file's age by bumping its modification time to now.
fn touch(path: &Path) {
    let result = fs::File::options()
        .append(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to refresh cache entry age");
    }
}
