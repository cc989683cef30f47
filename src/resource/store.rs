//! The keyed resource store.
//!
//! Every remote thing the runtime touches - meta-tiles, meshes, textures,
//! configuration documents - lives here as a [`Resource`] keyed by its
//! canonical URL. The store hands out typed [`Handle`]s immediately; a
//! miss creates a stub in `Initializing` and schedules a fetch, and the
//! caller polls [`Validity`] on later ticks. The single map mutex is held
//! only for lookup and insertion; all per-entry fields the render thread
//! reads are atomics.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::gpu::GpuCallbacks;
use crate::telemetry::MapStatistics;

use super::payload::{DecodeContext, PayloadKind, ResourceKind, ResourcePayload};
use super::state::{ResourceState, RetryState, Validity};

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// A URL was re-queried with a different payload type.
    #[error("resource '{url}' is {existing:?}, requested as {requested:?}")]
    KindMismatch {
        url: String,
        existing: ResourceKind,
        requested: ResourceKind,
    },
}

/// One cached resource.
///
/// Shared between the render thread (reads state, bumps priority and
/// access tick) and at most one fetch worker at a time (drives the
/// download transitions).
pub struct Resource {
    url: String,
    kind: ResourceKind,
    state: AtomicU8,
    /// f64 bits; priorities accumulate via max during a tick.
    priority: AtomicU64,
    last_access_tick: AtomicU64,
    ram_bytes: AtomicU64,
    gpu_bytes: AtomicU64,
    /// Creation order, tiebreak for the fetch queue.
    seq: u64,
    /// Raw downloaded bytes awaiting decode.
    content: Mutex<Option<Bytes>>,
    payload: RwLock<Option<Arc<ResourcePayload>>>,
    retry: Mutex<RetryState>,
    cancel: CancellationToken,
}

impl Resource {
    fn new(url: String, kind: ResourceKind, seq: u64, tick: u64) -> Self {
        Self {
            url,
            kind,
            state: AtomicU8::new(ResourceState::Initializing as u8),
            priority: AtomicU64::new(0f64.to_bits()),
            last_access_tick: AtomicU64::new(tick),
            ram_bytes: AtomicU64::new(0),
            gpu_bytes: AtomicU64::new(0),
            seq,
            content: Mutex::new(None),
            payload: RwLock::new(None),
            retry: Mutex::new(RetryState::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn state(&self) -> ResourceState {
        ResourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ResourceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn priority(&self) -> f64 {
        f64::from_bits(self.priority.load(Ordering::Relaxed))
    }

    /// Raises the priority to at least `p`; never lowers it.
    pub fn update_priority(&self, p: f64) {
        let mut cur = self.priority.load(Ordering::Relaxed);
        while f64::from_bits(cur) < p {
            match self.priority.compare_exchange_weak(
                cur,
                p.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn last_access_tick(&self) -> u64 {
        self.last_access_tick.load(Ordering::Relaxed)
    }

    pub fn touch(&self, tick: u64) {
        self.last_access_tick.fetch_max(tick, Ordering::Relaxed);
    }

    pub fn ram_bytes(&self) -> u64 {
        self.ram_bytes.load(Ordering::Relaxed)
    }

    pub fn gpu_bytes(&self) -> u64 {
        self.gpu_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Current validity; an `ErrorRetry` whose back-off elapsed reads as
    /// `Indeterminate` (the next tick re-arms it).
    pub fn validity(&self) -> Validity {
        match self.state() {
            ResourceState::Ready => Validity::Valid,
            ResourceState::ErrorFatal => Validity::Invalid,
            _ => Validity::Indeterminate,
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Claims the entry for a download; fails if another transition won.
    pub(crate) fn try_begin_download(&self) -> bool {
        self.state
            .compare_exchange(
                ResourceState::Initializing as u8,
                ResourceState::Downloading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn complete_download(&self, bytes: Bytes) {
        self.ram_bytes.store(bytes.len() as u64, Ordering::Relaxed);
        *self.content.lock() = Some(bytes);
        self.retry.lock().reset();
        self.set_state(ResourceState::Downloaded);
    }

    /// Schedules a transient retry with exponential back-off.
    pub(crate) fn fail_retry(&self, now: Instant) {
        self.retry.lock().schedule_backoff(now);
        self.set_state(ResourceState::ErrorRetry);
    }

    /// Schedules a short retry behind a pending auth refresh.
    pub(crate) fn fail_auth_retry(&self, now: Instant) {
        self.retry.lock().schedule_auth_retry(now);
        self.set_state(ResourceState::ErrorRetry);
    }

    pub(crate) fn fail_fatal(&self) {
        self.set_state(ResourceState::ErrorFatal);
    }

    /// Rewinds an errored or downloading entry to `Initializing` for a
    /// fresh fetch (auth refresh, retry re-arm).
    pub(crate) fn rewind_to_initializing(&self) {
        self.set_state(ResourceState::Initializing);
    }

    /// Marks a `Ready` entry stale so it gets fetched again; only one
    /// caller wins, so the refresh is scheduled exactly once.
    pub(crate) fn try_mark_stale(&self) -> bool {
        self.state
            .compare_exchange(
                ResourceState::Ready as u8,
                ResourceState::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn retry_elapsed(&self, now: Instant) -> bool {
        self.retry.lock().elapsed(now)
    }

    /// The decoded payload, if `Ready`.
    pub fn payload(&self) -> Option<Arc<ResourcePayload>> {
        self.payload.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn force_ready_for_tests(&self) {
        self.set_state(ResourceState::Ready);
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("url", &self.url)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish()
    }
}

/// Typed reference-counted handle into the store.
///
/// Holding a handle keeps the payload alive even if the entry is evicted
/// from the map; eviction protection during use comes from touching, not
/// from the reference count.
pub struct Handle<T: PayloadKind> {
    entry: Arc<Resource>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: PayloadKind> Handle<T> {
    fn new(entry: Arc<Resource>) -> Self {
        Self {
            entry,
            _marker: PhantomData,
        }
    }

    pub fn url(&self) -> &str {
        self.entry.url()
    }

    pub fn state(&self) -> ResourceState {
        self.entry.state()
    }

    pub fn validity(&self) -> Validity {
        self.entry.validity()
    }

    pub fn touch(&self, tick: u64) {
        self.entry.touch(tick);
    }

    pub fn update_priority(&self, p: f64) {
        self.entry.update_priority(p);
    }

    /// The typed payload, when `Ready`.
    pub fn value(&self) -> Option<Arc<T>> {
        self.entry.payload().and_then(|p| T::from_payload(&p))
    }

    /// The underlying untyped entry.
    pub fn resource(&self) -> &Arc<Resource> {
        &self.entry
    }
}

impl<T: PayloadKind> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self::new(self.entry.clone())
    }
}

impl<T: PayloadKind> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({:?})", self.entry)
    }
}

/// Memory budget of the store.
#[derive(Clone, Copy, Debug)]
pub struct StoreBudget {
    pub max_ram_bytes: u64,
    pub max_gpu_bytes: u64,
}

impl Default for StoreBudget {
    fn default() -> Self {
        Self {
            max_ram_bytes: 1024 * 1024 * 1024,
            max_gpu_bytes: 512 * 1024 * 1024,
        }
    }
}

/// The keyed cache of typed resources.
pub struct ResourceStore {
    entries: Mutex<HashMap<String, Arc<Resource>>>,
    fetch_tx: mpsc::UnboundedSender<Arc<Resource>>,
    budget: Mutex<StoreBudget>,
    next_seq: AtomicU64,
    current_tick: AtomicU64,
    statistics: Arc<MapStatistics>,
}

impl ResourceStore {
    /// Creates a store; the receiver side feeds the fetch pipeline.
    pub fn new(
        budget: StoreBudget,
        statistics: Arc<MapStatistics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Resource>>) {
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                entries: Mutex::new(HashMap::new()),
                fetch_tx,
                budget: Mutex::new(budget),
                next_seq: AtomicU64::new(0),
                current_tick: AtomicU64::new(0),
                statistics,
            }),
            fetch_rx,
        )
    }

    /// Current frame index, as set by the last `tick`.
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Relaxed)
    }

    /// Replaces the memory budget.
    pub fn set_budget(&self, budget: StoreBudget) {
        *self.budget.lock() = budget;
    }

    /// Returns a handle for `url`, creating a stub and scheduling a fetch
    /// on first request. Only one fetch is ever outstanding per URL.
    pub fn get<T: PayloadKind>(&self, url: &str) -> Result<Handle<T>, ResourceError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(url) {
            if entry.kind() != T::KIND {
                return Err(ResourceError::KindMismatch {
                    url: url.to_string(),
                    existing: entry.kind(),
                    requested: T::KIND,
                });
            }
            return Ok(Handle::new(entry.clone()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Resource::new(
            url.to_string(),
            T::KIND,
            seq,
            self.current_tick(),
        ));
        entries.insert(url.to_string(), entry.clone());
        drop(entries);

        self.statistics.resources_created.fetch_add(1, Ordering::Relaxed);
        trace!(url, kind = ?T::KIND, "resource stub created");
        // pipeline gone means shutdown; the stub stays Initializing
        let _ = self.fetch_tx.send(entry.clone());
        Ok(Handle::new(entry))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Looks up an existing entry without creating one.
    pub fn peek(&self, url: &str) -> Option<Arc<Resource>> {
        self.entries.lock().get(url).cloned()
    }

    /// Drives the state machine one render tick.
    ///
    /// Re-arms expired retries, decodes up to `max_processes` downloaded
    /// entries (`-1` = unbounded) and then evicts past the budget. Runs
    /// on the render thread.
    pub fn tick(
        &self,
        tick: u64,
        max_processes: i32,
        ctx: &DecodeContext,
        callbacks: &GpuCallbacks,
    ) {
        self.current_tick.store(tick, Ordering::Relaxed);
        let now = Instant::now();

        let snapshot: Vec<Arc<Resource>> = self.entries.lock().values().cloned().collect();

        // re-arm retries whose back-off elapsed
        for entry in &snapshot {
            if entry.state() == ResourceState::ErrorRetry && entry.retry_elapsed(now) {
                debug!(url = entry.url(), "retrying resource");
                entry.rewind_to_initializing();
                let _ = self.fetch_tx.send(entry.clone());
            }
        }

        // decode pass
        let mut processed = 0i32;
        for entry in &snapshot {
            if max_processes >= 0 && processed >= max_processes {
                break;
            }
            if entry.state() != ResourceState::Downloaded {
                continue;
            }
            entry.set_state(ResourceState::Finalizing);
            let content = entry.content.lock().take();
            let Some(content) = content else {
                entry.fail_fatal();
                continue;
            };
            processed += 1;
            match ResourcePayload::decode(entry.kind(), entry.url(), &content, ctx, callbacks) {
                Ok((payload, ram, gpu)) => {
                    entry.ram_bytes.store(ram, Ordering::Relaxed);
                    entry.gpu_bytes.store(gpu, Ordering::Relaxed);
                    *entry.payload.write() = Some(Arc::new(payload));
                    entry.set_state(ResourceState::Ready);
                    self.statistics
                        .resources_decoded
                        .fetch_add(1, Ordering::Relaxed);
                    trace!(url = entry.url(), ram, gpu, "resource ready");
                }
                Err(e) => {
                    error!(url = entry.url(), error = %e, "resource decode failed");
                    entry.fail_fatal();
                    self.statistics
                        .resources_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.evict(tick, &snapshot);
    }

    /// Evicts in ascending `(last_access_tick, priority)` order until the
    /// budget holds, skipping worker-owned entries, infinite priorities
    /// and anything touched this tick.
    fn evict(&self, tick: u64, snapshot: &[Arc<Resource>]) {
        let budget = *self.budget.lock();
        let mut ram_total: u64 = snapshot.iter().map(|e| e.ram_bytes()).sum();
        let mut gpu_total: u64 = snapshot.iter().map(|e| e.gpu_bytes()).sum();
        if ram_total <= budget.max_ram_bytes && gpu_total <= budget.max_gpu_bytes {
            return;
        }

        let mut victims: Vec<&Arc<Resource>> = snapshot
            .iter()
            .filter(|e| {
                !e.state().owned_by_worker()
                    && e.priority() != f64::INFINITY
                    && e.last_access_tick() < tick
            })
            .collect();
        victims.sort_by(|a, b| {
            a.last_access_tick()
                .cmp(&b.last_access_tick())
                .then(a.priority().total_cmp(&b.priority()))
        });

        let mut entries = self.entries.lock();
        for victim in victims {
            if ram_total <= budget.max_ram_bytes && gpu_total <= budget.max_gpu_bytes {
                break;
            }
            victim.cancel.cancel();
            if let Some(removed) = entries.remove(victim.url()) {
                ram_total = ram_total.saturating_sub(removed.ram_bytes());
                gpu_total = gpu_total.saturating_sub(removed.gpu_bytes());
                self.statistics
                    .resources_evicted
                    .fetch_add(1, Ordering::Relaxed);
                debug!(url = removed.url(), "resource evicted");
            }
        }
    }

    /// Drops every entry and cancels all in-flight fetches.
    ///
    /// Used when the map configuration is purged; handles held by the
    /// caller stay usable until dropped.
    pub fn purge(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.values() {
            entry.cancel.cancel();
        }
        entries.clear();
    }
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("entries", &self.len())
            .field("tick", &self.current_tick())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapconfig::AuthConfig;
    use crate::meta::MetaTile;

    fn store() -> (Arc<ResourceStore>, mpsc::UnboundedReceiver<Arc<Resource>>) {
        ResourceStore::new(StoreBudget::default(), Arc::new(MapStatistics::default()))
    }

    #[test]
    fn test_get_creates_stub_and_schedules_fetch() {
        let (store, mut rx) = store();
        let handle = store.get::<MetaTile>("https://e.com/a.meta").unwrap();
        assert_eq!(handle.state(), ResourceState::Initializing);
        assert_eq!(handle.validity(), Validity::Indeterminate);
        assert_eq!(store.len(), 1);
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.url(), "https://e.com/a.meta");
    }

    #[test]
    fn test_second_get_shares_entry() {
        let (store, mut rx) = store();
        let a = store.get::<MetaTile>("https://e.com/a.meta").unwrap();
        let b = store.get::<MetaTile>("https://e.com/a.meta").unwrap();
        assert!(Arc::ptr_eq(a.resource(), b.resource()));
        // only one fetch scheduled
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let (store, _rx) = store();
        store.get::<MetaTile>("https://e.com/a").unwrap();
        let err = store.get::<AuthConfig>("https://e.com/a");
        assert!(matches!(err, Err(ResourceError::KindMismatch { .. })));
    }

    #[test]
    fn test_priority_accumulates_max() {
        let (store, _rx) = store();
        let h = store.get::<MetaTile>("https://e.com/a").unwrap();
        h.update_priority(10.0);
        h.update_priority(5.0);
        assert_eq!(h.resource().priority(), 10.0);
        h.update_priority(f64::INFINITY);
        assert_eq!(h.resource().priority(), f64::INFINITY);
    }

    #[test]
    fn test_decode_advances_to_ready() {
        let (store, _rx) = store();
        let h = store.get::<AuthConfig>("https://e.com/auth.json").unwrap();
        h.resource().complete_download(Bytes::from_static(b"{}"));
        assert_eq!(h.state(), ResourceState::Downloaded);

        store.tick(1, -1, &DecodeContext::default(), &GpuCallbacks::default());
        assert_eq!(h.state(), ResourceState::Ready);
        assert_eq!(h.validity(), Validity::Valid);
        assert!(h.value().is_some());
    }

    #[test]
    fn test_decode_cap_per_tick() {
        let (store, _rx) = store();
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let h = store
                    .get::<AuthConfig>(&format!("https://e.com/{i}.json"))
                    .unwrap();
                h.resource().complete_download(Bytes::from_static(b"{}"));
                h
            })
            .collect();

        store.tick(1, 2, &DecodeContext::default(), &GpuCallbacks::default());
        let ready = handles
            .iter()
            .filter(|h| h.state() == ResourceState::Ready)
            .count();
        assert_eq!(ready, 2);

        store.tick(2, 2, &DecodeContext::default(), &GpuCallbacks::default());
        assert!(handles.iter().all(|h| h.state() == ResourceState::Ready));
    }

    #[test]
    fn test_bad_content_goes_fatal() {
        let (store, _rx) = store();
        let h = store.get::<AuthConfig>("https://e.com/auth.json").unwrap();
        h.resource().complete_download(Bytes::from_static(b"not json"));
        store.tick(1, -1, &DecodeContext::default(), &GpuCallbacks::default());
        assert_eq!(h.state(), ResourceState::ErrorFatal);
        assert_eq!(h.validity(), Validity::Invalid);
    }

    #[test]
    fn test_eviction_prefers_oldest() {
        let (store, _rx) = ResourceStore::new(
            StoreBudget {
                max_ram_bytes: 100,
                max_gpu_bytes: u64::MAX,
            },
            Arc::new(MapStatistics::default()),
        );
        let old = store.get::<AuthConfig>("https://e.com/old").unwrap();
        let new = store.get::<AuthConfig>("https://e.com/new").unwrap();
        old.resource().ram_bytes.store(80, Ordering::Relaxed);
        new.resource().ram_bytes.store(80, Ordering::Relaxed);
        old.resource().set_state(ResourceState::Ready);
        new.resource().set_state(ResourceState::Ready);
        old.touch(1);
        new.touch(5);

        store.tick(10, -1, &DecodeContext::default(), &GpuCallbacks::default());
        assert!(store.peek("https://e.com/old").is_none());
        assert!(store.peek("https://e.com/new").is_some());
    }

    #[test]
    fn test_eviction_skips_infinite_priority_and_workers() {
        let (store, _rx) = ResourceStore::new(
            StoreBudget {
                max_ram_bytes: 10,
                max_gpu_bytes: u64::MAX,
            },
            Arc::new(MapStatistics::default()),
        );
        let pinned = store.get::<AuthConfig>("https://e.com/pinned").unwrap();
        pinned.resource().ram_bytes.store(50, Ordering::Relaxed);
        pinned.update_priority(f64::INFINITY);

        let busy = store.get::<AuthConfig>("https://e.com/busy").unwrap();
        busy.resource().ram_bytes.store(50, Ordering::Relaxed);
        busy.resource().set_state(ResourceState::Downloading);

        store.tick(10, -1, &DecodeContext::default(), &GpuCallbacks::default());
        assert!(store.peek("https://e.com/pinned").is_some());
        assert!(store.peek("https://e.com/busy").is_some());
    }

    #[test]
    fn test_purge_clears_everything() {
        let (store, _rx) = store();
        store.get::<MetaTile>("https://e.com/a").unwrap();
        store.get::<MetaTile>("https://e.com/b").unwrap();
        store.purge();
        assert!(store.is_empty());
    }

    #[test]
    fn test_retry_rearm_reschedules_fetch() {
        let (store, mut rx) = store();
        let h = store.get::<MetaTile>("https://e.com/a").unwrap();
        rx.try_recv().unwrap();

        // schedule a retry already elapsed
        {
            let mut retry = h.resource().retry.lock();
            retry.attempts = 1;
            retry.next_attempt = Some(Instant::now() - std::time::Duration::from_secs(1));
        }
        h.resource().set_state(ResourceState::ErrorRetry);
        assert_eq!(h.validity(), Validity::Indeterminate);

        store.tick(1, -1, &DecodeContext::default(), &GpuCallbacks::default());
        assert_eq!(h.state(), ResourceState::Initializing);
        assert!(rx.try_recv().is_ok());
    }
}
