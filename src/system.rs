//! Storage provider contract
//!
//! The facade every provider implements: turn a virtual path into a typed
//! locator, answer metadata queries from it, list it as a directory, and
//! resolve symlinks. Header views are capability sets: fields may be known
//! up front or fetched lazily on first access, so callers always go through
//! [`Headers::get`].

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// Header keys carrying an object's size, in probe order.
pub const SIZE_KEYS: &[&str] = &["size", "Content-Length"];

/// Header keys carrying an object's modification time, in probe order.
pub const MTIME_KEYS: &[&str] = &["pushed_at", "updated_at", "published_at", "Last-Modified"];

/// Header keys carrying an object's creation time, in probe order.
pub const CTIME_KEYS: &[&str] = &["created_at"];

/// Capability-set view over an object's headers.
pub trait Headers {
    /// Get a header field. Fails `NotFound` when the field does not exist
    /// for this object; may issue network calls for lazily fetched fields.
    fn get(&self, key: &str) -> Result<Value>;

    /// The field names this view can serve.
    fn keys(&self) -> Vec<String>;

    fn len(&self) -> usize {
        self.keys().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plain header view over an already-known field map.
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders(pub BTreeMap<String, Value>);

impl Headers for StaticHeaders {
    fn get(&self, key: &str) -> Result<Value> {
        self.0
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// One directory entry from [`StorageSystem::list`].
pub struct Entry<H> {
    /// Entry name relative to the listed directory
    pub name: String,
    pub headers: H,
    pub is_dir: bool,
}

/// A storage provider exposing a POSIX-like view over a remote object store.
pub trait StorageSystem {
    /// Fully resolved per-path locator ("client arguments")
    type Locator;
    /// Provider header view
    type Header: Headers;

    /// Resolve a slash-separated virtual path into a locator.
    fn locator(&self, path: &str) -> Result<Self::Locator>;

    /// Object headers for a resolved locator.
    fn head(&self, locator: &Self::Locator) -> Result<Self::Header>;

    /// List the immediate children of a directory-like locator.
    fn list(&self, locator: &Self::Locator) -> Result<Vec<Entry<Self::Header>>>;

    fn is_dir(&self, locator: &Self::Locator) -> Result<bool>;

    fn is_file(&self, locator: &Self::Locator) -> Result<bool>;

    fn is_symlink(&self, locator: &Self::Locator) -> Result<bool>;

    /// Target path of a symbolic link. Fails `NotASymlink` when the object
    /// is not one.
    fn read_link(&self, locator: &Self::Locator) -> Result<String>;
}

/// Scalar header values may arrive as numbers or numeric strings.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Extract an object's size from its headers, probing [`SIZE_KEYS`] in order.
pub fn size_from_headers(headers: &dyn Headers) -> Option<u64> {
    SIZE_KEYS
        .iter()
        .find_map(|key| headers.get(key).ok().as_ref().and_then(as_u64))
}

/// Extract an object's mtime string from its headers, probing [`MTIME_KEYS`]
/// in order.
pub fn mtime_from_headers(headers: &dyn Headers) -> Option<String> {
    MTIME_KEYS
        .iter()
        .find_map(|key| match headers.get(key) {
            Ok(Value::String(s)) => Some(s),
            _ => None,
        })
}

/// Extract an object's ctime string from its headers, probing [`CTIME_KEYS`]
/// in order.
pub fn ctime_from_headers(headers: &dyn Headers) -> Option<String> {
    CTIME_KEYS
        .iter()
        .find_map(|key| match headers.get(key) {
            Ok(Value::String(s)) => Some(s),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_headers(pairs: &[(&str, Value)]) -> StaticHeaders {
        StaticHeaders(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_static_headers_get() {
        let headers = static_headers(&[("size", Value::from(7u64))]);
        assert_eq!(headers.get("size").unwrap(), Value::from(7u64));
        assert!(matches!(headers.get("mode"), Err(Error::NotFound(_))));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_size_probe_order_and_string_numbers() {
        let headers = static_headers(&[("Content-Length", Value::from("2048"))]);
        assert_eq!(size_from_headers(&headers), Some(2048));

        // "size" wins over "Content-Length"
        let headers = static_headers(&[
            ("size", Value::from(10u64)),
            ("Content-Length", Value::from(999u64)),
        ]);
        assert_eq!(size_from_headers(&headers), Some(10));

        let headers = static_headers(&[]);
        assert_eq!(size_from_headers(&headers), None);
    }

    #[test]
    fn test_time_probe_orders() {
        let headers = static_headers(&[
            ("updated_at", Value::from("2024-02-01T00:00:00Z")),
            ("pushed_at", Value::from("2024-01-01T00:00:00Z")),
            ("created_at", Value::from("2020-01-01T00:00:00Z")),
        ]);
        assert_eq!(
            mtime_from_headers(&headers).as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(
            ctime_from_headers(&headers).as_deref(),
            Some("2020-01-01T00:00:00Z")
        );
    }
}
