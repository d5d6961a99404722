//! GitHub storage provider
//!
//! Maps GitHub owners, repositories, git references, trees, releases and
//! archives onto a POSIX-like virtual tree:
//!
//! ```text
//! owner/repo/branches/main/src/lib.rs
//! owner/repo/commits/<sha>/...
//! owner/repo/tree/<any-ref>/...
//! owner/repo/HEAD/...
//! owner/repo/releases/latest/assets/app.tar.gz
//! owner/repo/archive/v1.0.zip
//! ```
//!
//! Path resolution is purely structural and issues no network calls; header
//! fields are fetched lazily through the cache-aware REST client when they
//! are actually needed.

pub mod header;
pub mod list;
pub mod nodes;
pub mod resolve;
pub mod stream;

pub use header::ObjectHeader;
pub use nodes::NodeKind;
pub use resolve::{resolve, Content, Descriptor};
pub use stream::{download_url, GithubBackend};

use std::sync::Arc;

use tracing::debug;

use crate::cache::CacheHandle;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::github::nodes::{render_template, GIT_MODE_DIR, GIT_MODE_FILE, GIT_MODE_SYMLINK, GITHUB_API};
use crate::io::raw::{OpenMode, RawStream};
use crate::io::BufferedReader;
use crate::rest::client::check;
use crate::rest::{HttpTransport, Method, RestClient, Transport};
use crate::system::{Entry, Headers, StaticHeaders, StorageSystem};

/// Give up following symlink chains after this many hops
const SYMLINK_FOLLOW_LIMIT: usize = 40;

/// Header view of a GitHub virtual path: a real object's lazy headers, or
/// the borrowed time fields of a literal virtual directory.
pub enum GithubHeaders {
    Object(ObjectHeader),
    Virtual(StaticHeaders),
}

impl Headers for GithubHeaders {
    fn get(&self, key: &str) -> Result<serde_json::Value> {
        match self {
            GithubHeaders::Object(headers) => headers.get(key),
            GithubHeaders::Virtual(headers) => headers.get(key),
        }
    }

    fn keys(&self) -> Vec<String> {
        match self {
            GithubHeaders::Object(headers) => headers.keys(),
            GithubHeaders::Virtual(headers) => headers.keys(),
        }
    }
}

/// The GitHub-backed storage provider.
pub struct GithubFs {
    client: Arc<RestClient>,
    chunk_size: usize,
    max_workers: usize,
}

impl GithubFs {
    /// Build the provider with a fresh HTTP transport.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_transport(config, Arc::new(HttpTransport::new()?))
    }

    /// Build the provider over an explicit transport (shared session,
    /// tests).
    pub fn with_transport(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let cache = CacheHandle::new(config)?;
        let client = Arc::new(RestClient::new(GITHUB_API, config, cache, transport));
        Ok(Self {
            client,
            chunk_size: config.chunk_size,
            max_workers: config.max_workers,
        })
    }

    /// The REST client this provider issues API calls through.
    pub fn client(&self) -> &Arc<RestClient> {
        &self.client
    }

    /// Open a raw, seekable stream over a file path's content.
    pub fn open_read(&self, path: &str) -> Result<RawStream<GithubBackend>> {
        let spec = self.locator(path)?;
        let backend = GithubBackend::open(Arc::clone(&self.client), &spec)?;
        RawStream::open(backend, OpenMode::Read, path)
    }

    /// Open a buffered, read-ahead stream over a file path's content.
    pub fn open_buffered(&self, path: &str) -> Result<BufferedReader<GithubBackend>> {
        let spec = self.locator(path)?;
        let backend = GithubBackend::open(Arc::clone(&self.client), &spec)?;
        BufferedReader::new(Arc::new(backend), self.chunk_size, self.max_workers)
    }

    /// Unix permission bits for a resolved path. Tree entries carry real
    /// git mode bits; everything else reads 0644.
    pub fn mode_bits(&self, spec: &Descriptor) -> Result<u32> {
        if spec.object != NodeKind::Tree {
            return Ok(0o644);
        }
        let headers = ObjectHeader::fetch(Arc::clone(&self.client), spec)?;
        let mode = headers.get_str("mode")?;
        let tail = &mode[mode.len().saturating_sub(3)..];
        let bits = u32::from_str_radix(tail, 8).unwrap_or(0);
        Ok(if bits == 0 { 0o644 } else { bits })
    }

    /// Whether the tree entry's git mode starts with `prefix`, following
    /// symlink chains to their final target.
    fn has_git_mode(&self, spec: &Descriptor, prefix: &str) -> Result<bool> {
        let mut current = spec.clone();
        for _ in 0..SYMLINK_FOLLOW_LIMIT {
            let headers = match ObjectHeader::fetch(Arc::clone(&self.client), &current) {
                Ok(headers) => headers,
                Err(Error::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            };
            let mode = match headers.get_str("mode") {
                Ok(mode) => mode,
                Err(Error::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            };

            if mode.starts_with(prefix) {
                return Ok(true);
            }
            if mode != GIT_MODE_SYMLINK {
                return Ok(false);
            }

            let target = self.read_tree_link(&current)?;
            current = match self.link_target_spec(&current, &target) {
                Ok(spec) => spec,
                // Target outside the repository: nothing to check against
                Err(_) => return Ok(false),
            };
        }
        debug!(path = %spec.full_path, "symlink chain too deep");
        Ok(false)
    }

    /// Read a git symlink entry's target from its raw content.
    fn read_tree_link(&self, spec: &Descriptor) -> Result<String> {
        let headers = ObjectHeader::fetch(Arc::clone(&self.client), spec)?;
        if headers.get_str("mode")? != GIT_MODE_SYMLINK {
            return Err(Error::NotASymlink(spec.full_path.clone()));
        }

        let url = download_url(&self.client, spec)?;
        let response = check(self.client.request(&url, Method::Get)?, &spec.full_path)?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    /// Resolve a symlink target (relative to the link's directory) back into
    /// a descriptor within the same route. Fails for targets escaping the
    /// repository.
    fn link_target_spec(&self, spec: &Descriptor, target: &str) -> Result<Descriptor> {
        if target.starts_with('/') || target.contains("://") {
            return Err(Error::NotFound(target.to_string()));
        }
        let path = spec
            .field("path")
            .ok_or_else(|| Error::NotFound(spec.full_path.clone()))?;

        let dir = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let mut parts: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
        for segment in target.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(Error::NotFound(target.to_string()));
                    }
                }
                other => parts.push(other),
            }
        }
        let target_path = parts.join("/");

        let base = spec
            .full_path
            .trim_end_matches('/')
            .strip_suffix(path)
            .map(|base| base.trim_end_matches('/'))
            .ok_or_else(|| Error::NotFound(spec.full_path.clone()))?;

        resolve(&format!("{}/{}", base, target_path))
    }
}

impl StorageSystem for GithubFs {
    type Locator = Descriptor;
    type Header = GithubHeaders;

    fn locator(&self, path: &str) -> Result<Descriptor> {
        resolve(path)
    }

    fn head(&self, locator: &Descriptor) -> Result<GithubHeaders> {
        Ok(GithubHeaders::Object(ObjectHeader::fetch(
            Arc::clone(&self.client),
            locator,
        )?))
    }

    fn list(&self, locator: &Descriptor) -> Result<Vec<Entry<GithubHeaders>>> {
        list::list_content(&self.client, locator)
    }

    fn is_dir(&self, locator: &Descriptor) -> Result<bool> {
        if locator.object.is_structural_dir() {
            return Ok(true);
        }
        if locator.object == NodeKind::Tree {
            return self.has_git_mode(locator, GIT_MODE_DIR);
        }
        Ok(false)
    }

    fn is_file(&self, locator: &Descriptor) -> Result<bool> {
        if locator.object.is_structural_dir() {
            return Ok(false);
        }
        if locator.object == NodeKind::Tree {
            return self.has_git_mode(locator, GIT_MODE_FILE);
        }
        // Archives and assets: existence is the only question
        match ObjectHeader::fetch(Arc::clone(&self.client), locator) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_symlink(&self, locator: &Descriptor) -> Result<bool> {
        if locator.object == NodeKind::Tree {
            return match ObjectHeader::fetch(Arc::clone(&self.client), locator)
                .and_then(|headers| headers.get_str("mode"))
            {
                Ok(mode) => Ok(mode == GIT_MODE_SYMLINK),
                Err(Error::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            };
        }
        Ok(locator.object.def().symlink.is_some())
    }

    fn read_link(&self, locator: &Descriptor) -> Result<String> {
        if locator.object == NodeKind::Tree {
            return self.read_tree_link(locator);
        }

        if locator.object.def().symlink.is_none() {
            return Err(Error::NotASymlink(locator.full_path.clone()));
        }

        // Heading resolves ambiguous references and fills the fields the
        // target template needs (default branch, latest tag, commit sha)
        let headers = ObjectHeader::fetch(Arc::clone(&self.client), locator)?;
        let template = match locator.object {
            NodeKind::Reference => headers
                .node()
                .def()
                .symlink
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Error::NotASymlink(locator.full_path.clone()))?,
            node => node
                .def()
                .symlink
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Error::NotASymlink(locator.full_path.clone()))?,
        };

        let resolved = headers.spec();
        render_template(template, &locator.full_path, |name| {
            resolved
                .field(name)
                .map(str::to_string)
                .or_else(|| headers.get_str(name).ok())
        })
    }
}
