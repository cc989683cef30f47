//! Fetcher abstraction and implementations.
//!
//! The pipeline talks to the network through the [`Fetcher`] trait so
//! hosts can substitute their own transport and tests can run against an
//! in-memory fetcher. The trait is dyn-compatible (boxed futures) and
//! every fetch is cancellable from the outside via the pipeline's
//! per-resource token.

mod pipeline;

pub use pipeline::{AuthSlot, FetchPipeline, FetchPipelineConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;

/// Transport-level fetch failures. Status-code handling happens in the
/// pipeline; a reply with a 4xx/5xx status is not an `Err` here.
#[derive(Clone, Debug, Error)]
pub enum FetchError {
    /// Connection, DNS or protocol failure; retryable.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A completed fetch.
#[derive(Clone, Debug)]
pub struct FetchReply {
    /// HTTP status code.
    pub status: u16,
    pub content: Bytes,
    /// Expiry hint for the blob cache.
    pub expires: Option<Instant>,
}

impl FetchReply {
    /// Shorthand for a 200 reply without expiry.
    pub fn ok(content: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            content: content.into(),
            expires: None,
        }
    }

    /// Shorthand for an empty reply with the given status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content: Bytes::new(),
            expires: None,
        }
    }
}

/// Asynchronous, cancellable resource fetcher.
pub trait Fetcher: Send + Sync + 'static {
    /// Fetches `url` with the given extra request headers.
    fn fetch(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> BoxFuture<'static, Result<FetchReply, FetchError>>;
}

/// Configuration of the reqwest-backed fetcher.
#[derive(Clone, Debug)]
pub struct HttpFetcherConfig {
    /// Per-request timeout enforced by the HTTP client itself; the
    /// pipeline applies its own deadline on top.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("terrastream/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Production fetcher backed by `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Parses a `Cache-Control: max-age` hint into an expiry instant.
    fn expires_from_headers(headers: &reqwest::header::HeaderMap) -> Option<Instant> {
        let value = headers.get(reqwest::header::CACHE_CONTROL)?.to_str().ok()?;
        let max_age = value
            .split(',')
            .map(str::trim)
            .find_map(|d| d.strip_prefix("max-age="))?;
        let secs: u64 = max_age.parse().ok()?;
        Some(Instant::now() + Duration::from_secs(secs))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> BoxFuture<'static, Result<FetchReply, FetchError>> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            let status = response.status().as_u16();
            let expires = Self::expires_from_headers(response.headers());
            let content = response
                .bytes()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            Ok(FetchReply {
                status,
                content,
                expires,
            })
        })
    }
}

/// Scripted response sequence for one URL of a [`MemoryFetcher`].
#[derive(Clone, Debug, Default)]
struct MemoryEntry {
    /// Replies consumed front to back; the last one repeats.
    replies: Vec<FetchReply>,
    served: usize,
}

/// Deterministic in-memory fetcher for tests and offline tooling.
///
/// Serves scripted replies per URL, optionally delaying each request to
/// model latency, and records request order and peak concurrency.
#[derive(Default)]
pub struct MemoryFetcher {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    delay: Option<Duration>,
    log: Mutex<Vec<String>>,
    in_flight: Arc<AtomicU32>,
    peak_in_flight: Arc<AtomicU32>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds latency to every request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Serves `reply` for every request of `url`.
    pub fn insert(&self, url: &str, reply: FetchReply) {
        self.entries.lock().insert(
            url.to_string(),
            MemoryEntry {
                replies: vec![reply],
                served: 0,
            },
        );
    }

    /// Serves the replies in order; the last repeats once exhausted.
    pub fn insert_sequence(&self, url: &str, replies: Vec<FetchReply>) {
        assert!(!replies.is_empty());
        self.entries
            .lock()
            .insert(url.to_string(), MemoryEntry { replies, served: 0 });
    }

    /// URLs in the order they were first requested.
    pub fn request_log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Highest number of simultaneously outstanding requests observed.
    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    fn next_reply(&self, url: &str) -> FetchReply {
        let mut entries = self.entries.lock();
        match entries.get_mut(url) {
            Some(entry) => {
                let idx = entry.served.min(entry.replies.len() - 1);
                entry.served += 1;
                entry.replies[idx].clone()
            }
            None => FetchReply::status(404),
        }
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
    ) -> BoxFuture<'static, Result<FetchReply, FetchError>> {
        self.log.lock().push(url.to_string());
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);

        let reply = self.next_reply(url);
        let delay = self.delay;
        let guard = InFlightGuard(self.in_flight.clone());
        Box::pin(async move {
            let _guard = guard;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(reply)
        })
    }
}

/// Decrements the in-flight counter when the request future completes or
/// is dropped by cancellation.
struct InFlightGuard(Arc<AtomicU32>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fetcher_serves_scripted_replies() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert_sequence(
            "https://e.com/a",
            vec![FetchReply::status(503), FetchReply::ok("body")],
        );
        let headers = HashMap::new();
        let first = fetcher.fetch("https://e.com/a", &headers).await.unwrap();
        assert_eq!(first.status, 503);
        let second = fetcher.fetch("https://e.com/a", &headers).await.unwrap();
        assert_eq!(second.status, 200);
        assert_eq!(second.content, "body");
        // last reply repeats
        let third = fetcher.fetch("https://e.com/a", &headers).await.unwrap();
        assert_eq!(third.status, 200);
        assert_eq!(fetcher.request_log().len(), 3);
    }

    #[tokio::test]
    async fn test_memory_fetcher_unknown_url_is_404() {
        let fetcher = MemoryFetcher::new();
        let reply = fetcher
            .fetch("https://e.com/missing", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(reply.status, 404);
    }

    #[test]
    fn test_expires_from_headers() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            "public, max-age=3600".parse().unwrap(),
        );
        let expires = HttpFetcher::expires_from_headers(&headers).unwrap();
        assert!(expires > Instant::now() + Duration::from_secs(3500));

        headers.insert(reqwest::header::CACHE_CONTROL, "no-store".parse().unwrap());
        assert!(HttpFetcher::expires_from_headers(&headers).is_none());
    }
}
