//! Cache-aware REST API client
//!
//! One client per storage instance. `get` keeps API responses in the disk
//! cache: hits inside the freshness window cost no network call, stale hits
//! are revalidated with a conditional request, and `304 Not Modified` serves
//! the cached payload unchanged. `request` absorbs API rate limiting, either
//! by blocking until the quota resets or by failing fast, per configuration.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheHandle, CacheMode};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::rest::{Method, Request, Response, Transport};

/// Rate-limit status endpoint, polled while waiting for the quota to reset
const RATE_LIMIT_PATH: &str = "/rate_limit";

/// Response header carrying the remaining request quota
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// A cached (result, response headers) pair plus the time it was fetched,
/// used to decide freshness without re-parsing HTTP dates.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
    result: Value,
    headers: BTreeMap<String, String>,
    fetched_at: u64,
}

impl CachedResponse {
    fn age(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.fetched_at))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Convert a non-success response into the matching typed error.
pub fn check(response: Response, path: &str) -> Result<Response> {
    if response.is_success() {
        return Ok(response);
    }
    let body = String::from_utf8_lossy(&response.body).into_owned();
    Err(Error::from_status(response.status, path, &body))
}

/// REST API client with disk-cache integration and rate-limit handling.
///
/// The transport session is shared read-only across calls; the client itself
/// is cheap to share behind an `Arc`.
pub struct RestClient {
    transport: Arc<dyn Transport>,
    cache: CacheHandle,
    base_url: String,
    token: Option<String>,
    wait_rate_limit: bool,
    wait_retry_delay: Duration,
    freshness_window: Duration,
    rate_limit_warned: AtomicBool,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        config: &Config,
        cache: CacheHandle,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            transport,
            cache,
            base_url: base_url.into(),
            token: config.token.clone(),
            wait_rate_limit: config.wait_rate_limit,
            wait_retry_delay: config.wait_retry_delay,
            freshness_window: config.cache_short_expiry,
            rate_limit_warned: AtomicBool::new(false),
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        match &self.token {
            Some(token) => vec![("Authorization".to_string(), format!("token {}", token))],
            None => Vec::new(),
        }
    }

    /// Issue one HTTP call, transparently absorbing API rate limiting.
    ///
    /// When the API signals an exhausted quota (403 plus a zero
    /// remaining-quota header), either waits for the limit to reset and
    /// retries, or fails with [`Error::RateLimitExceeded`], per
    /// configuration. The response status is otherwise returned unchecked;
    /// use [`check`] to convert failures into typed errors.
    pub fn request(&self, path: &str, method: Method) -> Result<Response> {
        self.request_with(path, method, &[], &[])
    }

    pub(crate) fn request_with(
        &self,
        path: &str,
        method: Method,
        params: &[(String, String)],
        extra_headers: &[(String, String)],
    ) -> Result<Response> {
        let url = self.url_for(path);
        loop {
            let mut request = Request::new(method, url.clone());
            request.params = params.to_vec();
            request.headers = self.auth_headers();
            request.headers.extend_from_slice(extra_headers);

            let response = self.transport.send(&request)?;

            if response.status == 403 && response.header(RATE_LIMIT_REMAINING) == Some("0") {
                self.wait_for_rate_limit()?;
                continue;
            }
            return Ok(response);
        }
    }

    /// Block until the remaining quota is positive, polling the rate-limit
    /// status endpoint between sleeps. This loop has no upper bound: the
    /// remote quota is guaranteed to eventually reset. Fails immediately
    /// when waiting is disabled.
    fn wait_for_rate_limit(&self) -> Result<()> {
        if !self.wait_rate_limit {
            return Err(Error::RateLimitExceeded);
        }

        loop {
            if !self.rate_limit_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    delay_secs = self.wait_retry_delay.as_secs(),
                    "API rate limit reached, waiting for reset"
                );
            }
            std::thread::sleep(self.wait_retry_delay);

            let mut request = Request::new(Method::Get, self.url_for(RATE_LIMIT_PATH));
            request.headers = self.auth_headers();
            let response = self.transport.send(&request)?;

            let remaining = response.json()?["resources"]["core"]["remaining"]
                .as_i64()
                .unwrap_or(0);
            if remaining > 0 {
                debug!(remaining = remaining, "rate limit reset");
                return Ok(());
            }
        }
    }

    /// Cache-aware GET.
    ///
    /// Cache key is the path plus the serialized parameters. A cached entry
    /// inside the freshness window (or marked `never_expire`) is returned
    /// with zero network calls. A stale entry is revalidated with a
    /// conditional request: `304` serves the cached payload unchanged, any
    /// other success replaces the entry (long mode, so repeated conditional
    /// checks stay cheap). Returns the parsed body and the response headers.
    pub fn get(
        &self,
        path: &str,
        params: &[(String, String)],
        never_expire: bool,
    ) -> Result<(Value, BTreeMap<String, String>)> {
        let mut cache_key = path.to_string();
        if !params.is_empty() {
            cache_key.push_str(&serde_json::to_string(params)?);
        }

        let cached: Option<CachedResponse> = match self.cache.get(&cache_key) {
            Ok(entry) => Some(entry),
            Err(CacheError::Miss) => None,
            Err(e) => {
                warn!(path = path, error = %e, "ignoring unreadable cache entry");
                None
            }
        };

        if let Some(entry) = &cached {
            if never_expire || entry.age() < self.freshness_window {
                debug!(path = path, "API response served from cache");
                return Ok((entry.result.clone(), entry.headers.clone()));
            }
        }

        // Revalidate instead of refetching when the cached response carried
        // validators; the API answers 304 without consuming rate quota.
        let mut conditional = Vec::new();
        if let Some(entry) = &cached {
            if let Some(modified) = entry.headers.get("last-modified") {
                conditional.push(("If-Modified-Since".to_string(), modified.clone()));
            }
            if let Some(etag) = entry.headers.get("etag") {
                conditional.push(("If-None-Match".to_string(), etag.clone()));
            }
        }

        let response = self.request_with(path, Method::Get, params, &conditional)?;

        if response.status == 304 {
            if let Some(entry) = cached {
                debug!(path = path, "not modified, cached payload still valid");
                return Ok((entry.result, entry.headers));
            }
        }

        let response = check(response, path)?;
        let result = response.json()?;
        let entry = CachedResponse {
            result: result.clone(),
            headers: response.headers.clone(),
            fetched_at: unix_now(),
        };
        if let Err(e) = self.cache.set(&cache_key, &entry, CacheMode::Long) {
            warn!(path = path, error = %e, "failed to cache API response");
        }
        Ok((result, entry.headers))
    }

    /// Lazy sequence of items from a paged endpoint.
    ///
    /// Pages are numbered from 1. The last page number comes from the first
    /// response's `Link` header (`rel="last"`); when the header is absent the
    /// sequence ends after the current page. A `Link` header without a last
    /// page marker is a fatal error: silently truncating paginated results
    /// would be worse than failing.
    pub fn get_paged(&self, path: &str, params: &[(String, String)]) -> Paged<'_> {
        Paged {
            client: self,
            path: path.to_string(),
            params: params.to_vec(),
            next_page: 1,
            max_page: 0,
            buffer: std::collections::VecDeque::new(),
            done: false,
            failed: None,
        }
    }
}

/// Iterator over the items of a paged endpoint. See [`RestClient::get_paged`].
pub struct Paged<'a> {
    client: &'a RestClient,
    path: String,
    params: Vec<(String, String)>,
    next_page: u32,
    /// 0 until the first response discloses the last page number
    max_page: u32,
    buffer: std::collections::VecDeque<Value>,
    done: bool,
    /// Fatal error held back until the already-received items are drained
    failed: Option<Error>,
}

impl Iterator for Paged<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            if let Some(e) = self.failed.take() {
                return Some(Err(e));
            }
            if self.done {
                return None;
            }

            let mut params = self.params.clone();
            if self.next_page > 1 {
                params.push(("page".to_string(), self.next_page.to_string()));
            }

            let (result, headers) = match self.client.get(&self.path, &params, false) {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            self.buffer
                .extend(result.as_array().cloned().unwrap_or_default());

            if self.max_page == 0 {
                match headers.get("link") {
                    // No Link header: this is the only page
                    None => self.done = true,
                    Some(links) => match parse_link_header(links) {
                        Ok(last) => self.max_page = last,
                        Err(e) => {
                            self.done = true;
                            self.failed = Some(e);
                        }
                    },
                }
            }

            self.next_page += 1;
            if self.max_page != 0 && self.next_page > self.max_page {
                self.done = true;
            }
        }
    }
}

/// Extract the last page number from a `Link` header value.
fn parse_link_header(links: &str) -> Result<u32> {
    for link in links.split(',') {
        let Some((url_part, rel_part)) = link.split_once(';') else {
            continue;
        };
        if rel_part.trim() != r#"rel="last""# {
            continue;
        }
        let url = url_part.trim().trim_start_matches('<').trim_end_matches('>');
        if let Some((_, query)) = url.split_once('?') {
            for pair in query.split('&') {
                if let Some(("page", value)) = pair.split_once('=') {
                    if let Ok(page) = value.parse() {
                        return Ok(page);
                    }
                }
            }
        }
    }
    Err(Error::MalformedLinkHeader(links.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::testing::FakeTransport;

    const BASE: &str = "https://api.example.com";

    fn client_with(
        transport: Arc<FakeTransport>,
        configure: impl FnOnce(&mut Config),
    ) -> (tempfile::TempDir, RestClient) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            cache_dir: dir.path().to_path_buf(),
            wait_retry_delay: Duration::from_millis(1),
            ..Config::default()
        };
        configure(&mut config);
        let cache = CacheHandle::new(&config).unwrap();
        let client = RestClient::new(BASE, &config, cache, transport);
        (dir, client)
    }

    #[test]
    fn test_fresh_cache_hit_issues_single_request() {
        let transport = Arc::new(FakeTransport::new());
        transport.on_json(
            Method::Get,
            &format!("{}/repos/o/r", BASE),
            200,
            serde_json::json!({"default_branch": "main"}),
            &[],
        );
        let (_dir, client) = client_with(Arc::clone(&transport), |_| {});

        let (first, _) = client.get("/repos/o/r", &[], false).unwrap();
        let (second, _) = client.get("/repos/o/r", &[], false).unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn test_params_distinguish_cache_entries() {
        let transport = Arc::new(FakeTransport::new());
        transport.on_json(
            Method::Get,
            &format!("{}/list", BASE),
            200,
            serde_json::json!([1]),
            &[],
        );
        transport.on_json(
            Method::Get,
            &format!("{}/list?page=2", BASE),
            200,
            serde_json::json!([2]),
            &[],
        );
        let (_dir, client) = client_with(Arc::clone(&transport), |_| {});

        let page2 = vec![("page".to_string(), "2".to_string())];
        client.get("/list", &[], false).unwrap();
        client.get("/list", &page2, false).unwrap();
        client.get("/list", &page2, false).unwrap();

        assert_eq!(transport.request_count(), 2);
    }

    #[test]
    fn test_stale_hit_revalidates_and_304_returns_cached_payload() {
        let transport = Arc::new(FakeTransport::new());
        let url = format!("{}/repos/o/r", BASE);
        transport.on_json(
            Method::Get,
            &url,
            200,
            serde_json::json!({"id": 1}),
            &[("ETag", "\"v1\""), ("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT")],
        );
        transport.on_json(Method::Get, &url, 304, serde_json::json!(null), &[]);

        // Zero freshness window: every cached entry is immediately stale
        let (_dir, client) =
            client_with(Arc::clone(&transport), |c| c.cache_short_expiry = Duration::ZERO);

        let (first, _) = client.get("/repos/o/r", &[], false).unwrap();
        let (second, _) = client.get("/repos/o/r", &[], false).unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.request_count(), 2);

        // The second request carried the validators from the cached response
        let log = transport.log.lock().unwrap();
        let headers = &log[1].headers;
        assert!(headers
            .iter()
            .any(|(name, value)| name == "If-None-Match" && value == "\"v1\""));
        assert!(headers
            .iter()
            .any(|(name, _)| name == "If-Modified-Since"));
    }

    #[test]
    fn test_never_expire_skips_revalidation() {
        let transport = Arc::new(FakeTransport::new());
        transport.on_json(
            Method::Get,
            &format!("{}/git/trees/abc", BASE),
            200,
            serde_json::json!({"tree": []}),
            &[],
        );
        let (_dir, client) =
            client_with(Arc::clone(&transport), |c| c.cache_short_expiry = Duration::ZERO);

        client.get("/git/trees/abc", &[], true).unwrap();
        client.get("/git/trees/abc", &[], true).unwrap();
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn test_status_conversion() {
        let transport = Arc::new(FakeTransport::new());
        transport.on_json(
            Method::Get,
            &format!("{}/missing", BASE),
            404,
            serde_json::json!({"message": "Not Found"}),
            &[],
        );
        transport.on_json(
            Method::Get,
            &format!("{}/bad-sha", BASE),
            422,
            serde_json::json!({"message": "No commit found"}),
            &[],
        );
        transport.on_json(
            Method::Get,
            &format!("{}/secret", BASE),
            403,
            serde_json::json!({"message": "Forbidden"}),
            &[],
        );
        let (_dir, client) = client_with(Arc::clone(&transport), |_| {});

        assert!(matches!(
            client.get("/missing", &[], false),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            client.get("/bad-sha", &[], false),
            Err(Error::NotFound(_))
        ));
        // 403 without a zero remaining-quota header is a permission error
        assert!(matches!(
            client.get("/secret", &[], false),
            Err(Error::Permission(_))
        ));
    }

    #[test]
    fn test_rate_limit_fails_fast_when_waiting_disabled() {
        let transport = Arc::new(FakeTransport::new());
        transport.on_json(
            Method::Get,
            &format!("{}/repos/o/r", BASE),
            403,
            serde_json::json!({"message": "rate limited"}),
            &[("X-RateLimit-Remaining", "0")],
        );
        let (_dir, client) =
            client_with(Arc::clone(&transport), |c| c.wait_rate_limit = false);

        let result = client.get("/repos/o/r", &[], false);
        assert!(matches!(result, Err(Error::RateLimitExceeded)));
        // No extra call to the status endpoint
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn test_rate_limit_waits_and_retries() {
        let transport = Arc::new(FakeTransport::new());
        let url = format!("{}/repos/o/r", BASE);
        transport.on_json(
            Method::Get,
            &url,
            403,
            serde_json::json!({"message": "rate limited"}),
            &[("X-RateLimit-Remaining", "0")],
        );
        transport.on_json(Method::Get, &url, 200, serde_json::json!({"id": 7}), &[]);
        transport.on_json(
            Method::Get,
            &format!("{}/rate_limit", BASE),
            200,
            serde_json::json!({"resources": {"core": {"remaining": 42}}}),
            &[],
        );
        let (_dir, client) = client_with(Arc::clone(&transport), |_| {});

        let (result, _) = client.get("/repos/o/r", &[], false).unwrap();
        assert_eq!(result["id"], 7);
        // Limited attempt, status poll, successful retry
        assert_eq!(transport.request_count(), 3);
    }

    #[test]
    fn test_get_paged_aggregates_pages_in_order() {
        let transport = Arc::new(FakeTransport::new());
        let url = format!("{}/repos/o/r/branches", BASE);
        transport.on_json(
            Method::Get,
            &url,
            200,
            serde_json::json!([{"n": 1}]),
            &[("Link", &format!("<{}?page=2>; rel=\"next\", <{}?page=5>; rel=\"last\"", url, url))],
        );
        for page in 2..=5 {
            transport.on_json(
                Method::Get,
                &format!("{}?page={}", url, page),
                200,
                serde_json::json!([{"n": page}]),
                &[],
            );
        }
        let (_dir, client) = client_with(Arc::clone(&transport), |_| {});

        let items: Result<Vec<Value>> = client.get_paged("/repos/o/r/branches", &[]).collect();
        let items = items.unwrap();

        assert_eq!(items.len(), 5);
        let order: Vec<i64> = items.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        assert_eq!(transport.request_count(), 5);
    }

    #[test]
    fn test_get_paged_without_link_header_is_single_page() {
        let transport = Arc::new(FakeTransport::new());
        transport.on_json(
            Method::Get,
            &format!("{}/repos/o/r/tags", BASE),
            200,
            serde_json::json!([{"name": "v1"}, {"name": "v2"}]),
            &[],
        );
        let (_dir, client) = client_with(Arc::clone(&transport), |_| {});

        let items: Result<Vec<Value>> = client.get_paged("/repos/o/r/tags", &[]).collect();
        assert_eq!(items.unwrap().len(), 2);
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn test_get_paged_malformed_link_header_is_fatal() {
        let transport = Arc::new(FakeTransport::new());
        let url = format!("{}/repos/o/r/commits", BASE);
        transport.on_json(
            Method::Get,
            &url,
            200,
            serde_json::json!([{"sha": "a"}]),
            &[("Link", &format!("<{}?page=2>; rel=\"next\"", url))],
        );
        let (_dir, client) = client_with(Arc::clone(&transport), |_| {});

        let mut paged = client.get_paged("/repos/o/r/commits", &[]);
        // The first page's item is buffered before the header is inspected;
        // the malformed marker surfaces as the page error
        let results: Vec<Result<Value>> = paged.by_ref().collect();
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::MalformedLinkHeader(_)))));
    }

    #[test]
    fn test_parse_link_header() {
        let links = "<https://x/y?page=2>; rel=\"next\", <https://x/y?per_page=10&page=34>; rel=\"last\"";
        assert_eq!(parse_link_header(links).unwrap(), 34);

        assert!(matches!(
            parse_link_header("<https://x/y?page=2>; rel=\"next\""),
            Err(Error::MalformedLinkHeader(_))
        ));
    }
}
