//! Error types
//!
//! Structured error handling for storage operations. Maps HTTP status codes
//! to specific error variants so callers can distinguish the filesystem-shaped
//! failures (not found, permission, exists, not-a-directory) from transport
//! problems.

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No such file or directory: '{0}'")]
    NotFound(String),

    #[error("Permission denied: '{0}'")]
    Permission(String),

    #[error("File exists: '{0}'")]
    AlreadyExists(String),

    #[error("Not a directory: '{0}'")]
    NotADirectory(String),

    #[error("Is a directory: '{0}'")]
    IsADirectory(String),

    #[error("Not a symbolic link: '{0}'")]
    NotASymlink(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("API rate limit exceeded")]
    RateLimitExceeded,

    #[error("Last page marker not found in \"Link\" header: {0}")]
    MalformedLinkHeader(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request error (HTTP {0}): {1}")]
    Request(u16, String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an Error from a non-success HTTP status code and the path that
    /// was being accessed.
    ///
    /// 422 is included in the not-found mapping: the API sometimes returns it
    /// instead of 404 when a commit hash does not exist.
    pub fn from_status(status: u16, path: &str, body: &str) -> Self {
        match status {
            403 => Error::Permission(path.to_string()),
            404 | 422 => Error::NotFound(path.to_string()),
            500..=599 => Error::Server(status, body.to_string()),
            _ => Error::Request(status, body.to_string()),
        }
    }

    /// Whether this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether this error means the object may exist but cannot be accessed.
    pub fn is_permission(&self) -> bool {
        matches!(self, Error::Permission(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            Error::from_status(404, "a/b", ""),
            Error::NotFound(_)
        ));
        // The API reports unknown commit hashes as 422
        assert!(matches!(
            Error::from_status(422, "a/b", ""),
            Error::NotFound(_)
        ));
        assert!(matches!(
            Error::from_status(403, "a/b", ""),
            Error::Permission(_)
        ));
        assert!(matches!(
            Error::from_status(503, "a/b", "overloaded"),
            Error::Server(503, _)
        ));
        assert!(matches!(
            Error::from_status(418, "a/b", ""),
            Error::Request(418, _)
        ));
    }

    #[test]
    fn test_predicates() {
        assert!(Error::from_status(404, "x", "").is_not_found());
        assert!(Error::from_status(403, "x", "").is_permission());
        assert!(!Error::RateLimitExceeded.is_not_found());
    }
}
