//! Generic HTTP storage provider
//!
//! Serves single objects over plain `http(s)://` URLs: metadata comes from a
//! `HEAD` request, content from range `GET`s. There is no directory
//! structure and no write path; everything directory- or write-shaped fails
//! with an unsupported-operation error.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::io::raw::{http_range, ObjectBackend, OpenMode, RawStream};
use crate::io::BufferedReader;
use crate::rest::client::check;
use crate::rest::{HttpTransport, Method, Request, Transport};
use crate::system::{Entry, Headers, StaticHeaders, StorageSystem};

/// Locator for a plain-HTTP object: just its URL.
#[derive(Debug, Clone)]
pub struct HttpLocator {
    pub url: String,
}

/// HTTP storage provider.
pub struct HttpFs {
    transport: Arc<dyn Transport>,
}

impl HttpFs {
    pub fn new() -> Result<Self> {
        Ok(Self {
            transport: Arc::new(HttpTransport::new()?),
        })
    }

    /// Build over an explicit transport (shared session, tests).
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn head_response(&self, url: &str) -> Result<BTreeMap<String, Value>> {
        let request = Request::new(Method::Head, url);
        let response = check(self.transport.send(&request)?, url)?;
        Ok(response
            .headers
            .into_iter()
            .map(|(name, value)| (canonical_header_name(&name), Value::from(value)))
            .collect())
    }

    /// Open a raw stream over the object. Read-only; seekable when the
    /// server advertises `Accept-Ranges: bytes`.
    pub fn open_read(&self, url: &str) -> Result<RawStream<HttpBackend>> {
        let backend = HttpBackend::open(Arc::clone(&self.transport), url)?;
        RawStream::open(backend, OpenMode::Read, url)
    }

    /// Open a buffered, read-ahead stream over the object.
    pub fn open_buffered(
        &self,
        url: &str,
        chunk_size: usize,
        workers: usize,
    ) -> Result<BufferedReader<HttpBackend>> {
        let backend = HttpBackend::open(Arc::clone(&self.transport), url)?;
        BufferedReader::new(Arc::new(backend), chunk_size, workers)
    }
}

/// HTTP response headers are stored lowercased; present them in the
/// canonical `Content-Length` style the size/time probes use.
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

impl StorageSystem for HttpFs {
    type Locator = HttpLocator;
    type Header = StaticHeaders;

    fn locator(&self, path: &str) -> Result<Self::Locator> {
        Ok(HttpLocator {
            url: path.to_string(),
        })
    }

    fn head(&self, locator: &Self::Locator) -> Result<Self::Header> {
        Ok(StaticHeaders(self.head_response(&locator.url)?))
    }

    fn list(&self, _locator: &Self::Locator) -> Result<Vec<Entry<Self::Header>>> {
        Err(Error::Unsupported("listing HTTP objects"))
    }

    fn is_dir(&self, _locator: &Self::Locator) -> Result<bool> {
        Ok(false)
    }

    fn is_file(&self, locator: &Self::Locator) -> Result<bool> {
        match self.head(locator) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_symlink(&self, _locator: &Self::Locator) -> Result<bool> {
        Ok(false)
    }

    fn read_link(&self, locator: &Self::Locator) -> Result<String> {
        Err(Error::NotASymlink(locator.url.clone()))
    }
}

/// Range-read backend over one HTTP URL.
pub struct HttpBackend {
    transport: Arc<dyn Transport>,
    url: String,
    seekable: bool,
    size: Mutex<Option<u64>>,
}

impl HttpBackend {
    /// Probe the object with a `HEAD` request and capture seekability from
    /// `Accept-Ranges`.
    pub fn open(transport: Arc<dyn Transport>, url: &str) -> Result<Self> {
        let request = Request::new(Method::Head, url);
        let response = check(transport.send(&request)?, url)?;

        let seekable = response.header("accept-ranges") == Some("bytes");
        let size = response
            .header("content-length")
            .and_then(|v| v.parse().ok());
        debug!(url = url, seekable = seekable, size = ?size, "HTTP object probed");

        Ok(Self {
            transport,
            url: url.to_string(),
            seekable,
            size: Mutex::new(size),
        })
    }
}

impl ObjectBackend for HttpBackend {
    fn size(&self) -> Result<u64> {
        if let Some(size) = *self.size.lock().unwrap() {
            return Ok(size);
        }
        let request = Request::new(Method::Head, &self.url);
        let response = check(self.transport.send(&request)?, &self.url)?;
        let size = response
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        *self.size.lock().unwrap() = Some(size);
        Ok(size)
    }

    fn read_range(&self, start: u64, end: Option<u64>) -> Result<Vec<u8>> {
        let mut request = Request::new(Method::Get, &self.url);
        request
            .headers
            .push(("Range".to_string(), http_range(start, end)));

        let response = self.transport.send(&request)?;
        // Requested range entirely past the end: an empty read, not an error
        if response.status == 416 {
            return Ok(Vec::new());
        }
        Ok(check(response, &self.url)?.body)
    }

    fn upload(&self, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported("write"))
    }

    fn seekable(&self) -> bool {
        self.seekable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::testing::FakeTransport;
    use crate::system::size_from_headers;

    const URL: &str = "https://files.example.com/data.bin";

    fn serve_object(transport: &FakeTransport, content: &[u8]) {
        transport.on_raw(
            Method::Head,
            URL,
            200,
            Vec::new(),
            &[
                ("Content-Length", &content.len().to_string()),
                ("Accept-Ranges", "bytes"),
                ("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
            ],
        );
    }

    #[test]
    fn test_head_exposes_size_and_mtime() {
        let transport = Arc::new(FakeTransport::new());
        serve_object(&transport, b"0123456789");
        let fs = HttpFs::with_transport(transport);

        let locator = fs.locator(URL).unwrap();
        let headers = fs.head(&locator).unwrap();
        assert_eq!(size_from_headers(&headers), Some(10));
        assert!(headers.get("Last-Modified").is_ok());
    }

    #[test]
    fn test_missing_object_is_not_a_file() {
        let transport = Arc::new(FakeTransport::new());
        transport.on_raw(Method::Head, URL, 404, Vec::new(), &[]);
        let fs = HttpFs::with_transport(transport);

        let locator = fs.locator(URL).unwrap();
        assert!(!fs.is_file(&locator).unwrap());
        assert!(!fs.is_dir(&locator).unwrap());
    }

    #[test]
    fn test_range_reads_through_raw_stream() {
        let transport = Arc::new(FakeTransport::new());
        serve_object(&transport, b"0123456789");
        transport.on_raw(Method::Get, URL, 206, b"2345".to_vec(), &[]);
        let fs = HttpFs::with_transport(transport.clone());

        let stream = fs.open_read(URL).unwrap();
        stream.seek(std::io::SeekFrom::Start(2)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(stream.read_into(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"2345");

        // The GET carried the byte range
        let log = transport.log.lock().unwrap();
        let get = log.iter().find(|r| r.method == Method::Get).unwrap();
        assert!(get
            .headers
            .iter()
            .any(|(name, value)| name == "Range" && value == "bytes=2-5"));
    }

    #[test]
    fn test_416_is_an_empty_read() {
        let transport = Arc::new(FakeTransport::new());
        serve_object(&transport, b"abc");
        transport.on_raw(Method::Get, URL, 416, Vec::new(), &[]);
        let fs = HttpFs::with_transport(transport);

        let stream = fs.open_read(URL).unwrap();
        stream.seek(std::io::SeekFrom::Start(100)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read_into(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_writes_are_unsupported() {
        let transport = Arc::new(FakeTransport::new());
        serve_object(&transport, b"abc");
        let fs = HttpFs::with_transport(transport);

        let stream = fs.open_read(URL).unwrap();
        assert!(matches!(stream.write(b"x"), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_not_seekable_without_accept_ranges() {
        let transport = Arc::new(FakeTransport::new());
        transport.on_raw(
            Method::Head,
            URL,
            200,
            Vec::new(),
            &[("Content-Length", "3")],
        );
        let fs = HttpFs::with_transport(transport);

        let stream = fs.open_read(URL).unwrap();
        assert!(!stream.seekable());
        assert!(matches!(
            stream.seek(std::io::SeekFrom::Start(1)),
            Err(Error::Unsupported("seek"))
        ));
    }

    #[test]
    fn test_canonical_header_names() {
        assert_eq!(canonical_header_name("content-length"), "Content-Length");
        assert_eq!(canonical_header_name("etag"), "Etag");
    }
}
