//! Background fetch pipeline.
//!
//! A scheduler task drains fetch requests from the resource store into a
//! priority heap and hands the most urgent entry to a worker whenever a
//! download slot frees up. Workers drive the entry's state transitions;
//! the store and the render thread observe them through atomics. The
//! whole pipeline runs on the data runtime - the render thread never
//! waits on it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::BlobCache;
use crate::mapconfig::AuthConfig;
use crate::resource::{Handle, Resource};
use crate::telemetry::MapStatistics;

use super::{FetchError, Fetcher};

/// Configuration of the fetch pipeline.
#[derive(Clone, Debug)]
pub struct FetchPipelineConfig {
    /// Download slots; back-pressure beyond this is queueing.
    pub max_concurrent_downloads: usize,
    /// Deadline per fetch; expiry schedules a transient retry.
    pub fetch_timeout: Duration,
}

impl Default for FetchPipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 10,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared slot holding the active authentication resource.
///
/// Workers read the current headers from it before each request; a 401 or
/// 403 reply marks the resource stale so the scheduler refreshes it ahead
/// of everything else.
#[derive(Clone, Default)]
pub struct AuthSlot {
    inner: Arc<RwLock<Option<Handle<AuthConfig>>>>,
}

impl AuthSlot {
    pub fn set(&self, handle: Option<Handle<AuthConfig>>) {
        *self.inner.write() = handle;
    }

    /// Extra request headers from the ready auth payload, if any.
    fn headers(&self) -> HashMap<String, String> {
        self.inner
            .read()
            .as_ref()
            .and_then(|h| h.value())
            .map(|auth| auth.headers.clone())
            .unwrap_or_default()
    }

    fn entry(&self) -> Option<Arc<Resource>> {
        self.inner.read().as_ref().map(|h| h.resource().clone())
    }

    fn is_auth_entry(&self, entry: &Arc<Resource>) -> bool {
        self.entry()
            .map(|auth| Arc::ptr_eq(&auth, entry))
            .unwrap_or(false)
    }
}

/// Heap item; priority is snapshotted at enqueue, which is the lazy
/// adjustment strategy - a later priority bump re-sends the entry.
struct QueuedFetch(Arc<Resource>, f64);

impl QueuedFetch {
    fn new(entry: Arc<Resource>) -> Self {
        let priority = entry.priority();
        Self(entry, priority)
    }
}

impl PartialEq for QueuedFetch {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1 && self.0.seq() == other.0.seq()
    }
}

impl Eq for QueuedFetch {}

impl PartialOrd for QueuedFetch {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedFetch {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // higher priority first, then FIFO by creation sequence
        self.1
            .total_cmp(&other.1)
            .then_with(|| other.0.seq().cmp(&self.0.seq()))
    }
}

/// Handle to the running pipeline.
pub struct FetchPipeline {
    shutdown: CancellationToken,
}

impl FetchPipeline {
    /// Spawns the scheduler on the given runtime.
    pub fn start(
        runtime: &tokio::runtime::Handle,
        config: FetchPipelineConfig,
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<BlobCache>,
        auth: AuthSlot,
        rx: mpsc::UnboundedReceiver<Arc<Resource>>,
        statistics: Arc<MapStatistics>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        runtime.spawn(scheduler(
            config,
            fetcher,
            cache,
            auth,
            rx,
            statistics,
            shutdown.clone(),
        ));
        Self { shutdown }
    }

    /// Stops the scheduler; in-flight fetches are abandoned.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for FetchPipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn scheduler(
    config: FetchPipelineConfig,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<BlobCache>,
    auth: AuthSlot,
    mut rx: mpsc::UnboundedReceiver<Arc<Resource>>,
    statistics: Arc<MapStatistics>,
    shutdown: CancellationToken,
) {
    info!(
        slots = config.max_concurrent_downloads,
        "fetch pipeline started"
    );
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads));
    let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<Arc<Resource>>();
    let mut heap: BinaryHeap<QueuedFetch> = BinaryHeap::new();

    loop {
        // fold in anything that arrived since the last pop
        while let Ok(entry) = rx.try_recv() {
            heap.push(QueuedFetch::new(entry));
        }
        while let Ok(entry) = requeue_rx.try_recv() {
            heap.push(QueuedFetch::new(entry));
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => {
                match received {
                    Some(entry) => heap.push(QueuedFetch::new(entry)),
                    None => break,
                }
            }
            received = requeue_rx.recv() => {
                if let Some(entry) = received {
                    heap.push(QueuedFetch::new(entry));
                }
            }
            permit = semaphore.clone().acquire_owned(), if !heap.is_empty() => {
                let Ok(permit) = permit else { break };
                let QueuedFetch(entry, _) = heap.pop().expect("heap checked non-empty");
                tokio::spawn(download(
                    entry,
                    config.fetch_timeout,
                    fetcher.clone(),
                    cache.clone(),
                    auth.clone(),
                    requeue_tx.clone(),
                    statistics.clone(),
                    permit,
                ));
            }
        }
    }
    info!("fetch pipeline stopped");
}

#[allow(clippy::too_many_arguments)]
async fn download(
    entry: Arc<Resource>,
    timeout: Duration,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<BlobCache>,
    auth: AuthSlot,
    requeue: mpsc::UnboundedSender<Arc<Resource>>,
    statistics: Arc<MapStatistics>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let token = entry.cancel_token();
    if token.is_cancelled() {
        return;
    }
    // another worker or an eviction may have raced us here
    if !entry.try_begin_download() {
        return;
    }

    let url = entry.url().to_string();
    let is_auth = auth.is_auth_entry(&entry);

    // credentials never go through the blob cache: a refresh must reach
    // the origin, and tokens have no business in a shared byte cache
    if !is_auth {
        if let Some(bytes) = cache.get(&url) {
            debug!(url = %url, "blob cache hit");
            statistics
                .bytes_downloaded
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            entry.complete_download(bytes);
            return;
        }
    }

    let headers = if is_auth {
        HashMap::new()
    } else {
        auth.headers()
    };

    let fetch = fetcher.fetch(&url, &headers);
    let reply = tokio::select! {
        // a cancelled entry was evicted or purged; discard the response
        _ = token.cancelled() => return,
        result = tokio::time::timeout(timeout, fetch) => result,
    };

    let now = Instant::now();
    match reply {
        Err(_elapsed) => {
            warn!(url = %url, "fetch timed out, scheduling retry");
            entry.fail_retry(now);
        }
        Ok(Err(FetchError::Transport(msg))) => {
            warn!(url = %url, error = %msg, "transport error, scheduling retry");
            entry.fail_retry(now);
        }
        Ok(Ok(reply)) => match reply.status {
            200..=299 => {
                statistics
                    .resources_downloaded
                    .fetch_add(1, Ordering::Relaxed);
                statistics
                    .bytes_downloaded
                    .fetch_add(reply.content.len() as u64, Ordering::Relaxed);
                if !is_auth {
                    cache.put(&url, reply.content.clone(), reply.expires);
                }
                entry.complete_download(reply.content);
            }
            401 | 403 => {
                if is_auth {
                    warn!(url = %url, status = reply.status, "auth config rejected");
                    entry.fail_fatal();
                } else {
                    debug!(url = %url, status = reply.status, "auth stale, refreshing");
                    if let Some(auth_entry) = auth.entry() {
                        if auth_entry.try_mark_stale() {
                            let _ = requeue.send(auth_entry);
                        }
                    }
                    entry.fail_auth_retry(now);
                }
            }
            408 | 429 | 500..=599 => {
                warn!(url = %url, status = reply.status, "server error, scheduling retry");
                entry.fail_retry(now);
            }
            status => {
                warn!(url = %url, status, "fatal fetch status");
                statistics.resources_failed.fetch_add(1, Ordering::Relaxed);
                entry.fail_fatal();
            }
        },
    }
}
