//! Content streams
//!
//! Turns a resolved descriptor into its download URL and serves range reads
//! over it through the REST client, so content transfers share the client's
//! auth headers and rate-limit handling. The virtual tree is read-only:
//! uploads fail with an unsupported-operation error.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result};
use crate::github::header::{ensure_release_archive_tag, ensure_release_tag};
use crate::github::nodes::{render_template, NodeKind};
use crate::github::resolve::Descriptor;
use crate::io::raw::{http_range, ObjectBackend};
use crate::rest::client::check;
use crate::rest::{Method, RestClient};

/// Download URL for a resolved descriptor's content.
///
/// Fails `IsADirectory` for paths without content. Release-level archives
/// and assets may first need the release tag filled in from the API.
pub fn download_url(client: &Arc<RestClient>, spec: &Descriptor) -> Result<String> {
    let mut spec = spec.clone();
    match spec.object {
        NodeKind::ReleaseAsset => ensure_release_tag(client, &mut spec)?,
        NodeKind::ReleaseArchive => ensure_release_archive_tag(client, &mut spec)?,
        _ => {}
    }

    let template = spec
        .object
        .def()
        .get
        .ok_or_else(|| Error::IsADirectory(spec.full_path.clone()))?;

    // Field values land in URL path segments; escape each segment but keep
    // the slashes separating hierarchical paths
    render_template(template, &spec.full_path, |name| {
        spec.field(name).map(|value| {
            value
                .split('/')
                .map(|segment| urlencoding::encode(segment).into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
    })
}

/// Range-read backend over one resolved object's download URL.
pub struct GithubBackend {
    client: Arc<RestClient>,
    url: String,
    name: String,
    seekable: bool,
    size: Mutex<Option<u64>>,
}

impl GithubBackend {
    /// Probe the object's download URL with a `HEAD` request and capture its
    /// size and seekability.
    pub fn open(client: Arc<RestClient>, spec: &Descriptor) -> Result<Self> {
        let url = download_url(&client, spec)?;
        let response = check(client.request(&url, Method::Head)?, &spec.full_path)?;

        let seekable = response.header("accept-ranges") == Some("bytes");
        let size = response
            .header("content-length")
            .and_then(|value| value.parse().ok());
        debug!(url = %url, size = ?size, seekable = seekable, "content stream opened");

        Ok(Self {
            client,
            url,
            name: spec.full_path.clone(),
            seekable,
            size: Mutex::new(size),
        })
    }

    /// The resolved download URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ObjectBackend for GithubBackend {
    fn size(&self) -> Result<u64> {
        if let Some(size) = *self.size.lock().unwrap() {
            return Ok(size);
        }
        let response = check(self.client.request(&self.url, Method::Head)?, &self.name)?;
        let size = response
            .header("content-length")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        *self.size.lock().unwrap() = Some(size);
        Ok(size)
    }

    fn read_range(&self, start: u64, end: Option<u64>) -> Result<Vec<u8>> {
        let range = [("Range".to_string(), http_range(start, end))];
        let response = self
            .client
            .request_with(&self.url, Method::Get, &[], &range)?;

        // Requested range entirely past the end: an empty read, not an error
        if response.status == 416 {
            return Ok(Vec::new());
        }
        Ok(check(response, &self.name)?.body)
    }

    fn upload(&self, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported("write"))
    }

    fn seekable(&self) -> bool {
        self.seekable
    }
}
