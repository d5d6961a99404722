//! Storage configuration
//!
//! A plain value injected at construction time; no global state. Host
//! applications embed it in their own configuration files via serde.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Short cache entries expire this long after they were written.
pub const CACHE_SHORT_EXPIRY: Duration = Duration::from_secs(60);

/// Long cache entries expire this long after they were last read.
pub const CACHE_LONG_EXPIRY: Duration = Duration::from_secs(172_800);

/// Default buffered stream chunk size: 8 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default worker count for parallel chunk transfer
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default delay between two rate-limit status checks while waiting
pub const DEFAULT_WAIT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Storage provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding cached API responses (created 0700 on first use)
    pub cache_dir: PathBuf,
    /// Expiry window for short-mode cache entries
    pub cache_short_expiry: Duration,
    /// Expiry window for long-mode cache entries (sliding: reset on access)
    pub cache_long_expiry: Duration,
    /// API authentication token, if any
    pub token: Option<String>,
    /// If true, block and retry when the API rate limit is exhausted;
    /// if false, fail immediately with a rate-limit error
    pub wait_rate_limit: bool,
    /// Delay between two rate-limit status checks while waiting
    pub wait_retry_delay: Duration,
    /// Buffered stream chunk size in bytes
    pub chunk_size: usize,
    /// Maximum number of worker threads per buffered stream
    pub max_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_short_expiry: CACHE_SHORT_EXPIRY,
            cache_long_expiry: CACHE_LONG_EXPIRY,
            token: None,
            wait_rate_limit: true,
            wait_retry_delay: DEFAULT_WAIT_RETRY_DELAY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Platform cache directory for this crate, falling back to /tmp.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cloudfs")
}
