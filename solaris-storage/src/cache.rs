//! Releasable LRU cache with singleflight creation.
//!
//! Hand-rolled rather than built on an off-the-shelf caching crate: this
//! cache's contract needs cancellable singleflight waiters and
//! reference-counted release, neither of which a generic LRU crate
//! exposes. Built from `Arc<Mutex<..>>` + `tokio::sync::Notify`.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use solaris_common::error::{Error, Result};

struct ReadyEntry<V> {
    value: Arc<V>,
    leases: usize,
}

struct CreateSlot<V> {
    done: Notify,
    result: Mutex<Option<std::result::Result<Arc<V>, String>>>,
}

enum Slot<V> {
    Creating(Arc<CreateSlot<V>>),
    Ready(ReadyEntry<V>),
}

struct State<K, V> {
    slots: HashMap<K, Slot<V>>,
    /// Keys with zero leases, in the order their lease count reached
    /// zero (least-recently-released first).
    evictable: Vec<K>,
    in_flight: usize,
    closed: bool,
}

/// A reference-counted handle on a cached value. Dropping it without
/// calling [`LruCache::release`] leaks the lease; callers must release
/// explicitly, mirroring the Go original's explicit `Release(lease)` call.
pub struct Lease<K, V> {
    key: K,
    value: Arc<V>,
}

impl<K: Clone, V> Lease<K, V> {
    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    pub fn key(&self) -> K {
        self.key.clone()
    }
}

pub struct LruCache<K, V> {
    capacity: usize,
    state: Mutex<State<K, V>>,
    changed: Notify,
    on_delete: Option<Box<dyn Fn(Arc<V>) + Send + Sync>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time hit/miss counters, a plain `Copy` snapshot rather than a
/// wired-up metrics exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self::with_on_delete(capacity, None)
    }

    pub fn with_on_delete(
        capacity: usize,
        on_delete: Option<Box<dyn Fn(Arc<V>) + Send + Sync>>,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                slots: HashMap::new(),
                evictable: Vec::new(),
                in_flight: 0,
                closed: false,
            }),
            changed: Notify::new(),
            on_delete,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a lease on `key`, running `create` at most once across all
    /// concurrently racing callers (singleflight). Blocks while the cache
    /// is at capacity and has nothing evictable, honoring `cancel`.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: K,
        create: F,
        cancel: &CancellationToken,
    ) -> Result<Lease<K, V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut create = Some(create);

        loop {
            let mut state = self.state.lock().await;

            if state.closed {
                return Err(Error::Closed);
            }

            if let Some(slot) = state.slots.get_mut(&key) {
                match slot {
                    Slot::Ready(entry) => {
                        entry.leases += 1;
                        state.evictable.retain(|k| k != &key);
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(Lease {
                            key,
                            value: entry.value.clone(),
                        });
                    }
                    Slot::Creating(flight) => {
                        let flight = flight.clone();
                        drop(state);

                        if wait_or_cancel(flight.done.notified(), cancel).await.is_err() {
                            return Err(Error::Cancelled);
                        }

                        let outcome = {
                            let guard = flight.result.lock().await;
                            match guard.as_ref() {
                                Some(Ok(value)) => Some(Ok(value.clone())),
                                Some(Err(msg)) => Some(Err(msg.clone())),
                                None => None,
                            }
                        };

                        match outcome {
                            Some(Ok(value)) => {
                                let mut state = self.state.lock().await;
                                if let Some(Slot::Ready(entry)) = state.slots.get_mut(&key) {
                                    entry.leases += 1;
                                    state.evictable.retain(|k| k != &key);
                                    return Ok(Lease { key, value });
                                }
                                // raced with an eviction; retry from scratch
                                continue;
                            }
                            Some(Err(msg)) => return Err(Error::internal(msg)),
                            None => continue,
                        }
                    }
                }
            }

            // `state.slots` already holds both `Ready` and `Creating`
            // entries (the latter inserted alongside `in_flight += 1`
            // below), so it alone is `known + in-flight`; do not add
            // `state.in_flight` a second time.
            let used = state.slots.len();

            if used >= self.capacity {
                if let Some(victim) = state.evictable.first().cloned() {
                    state.evictable.retain(|k| k != &victim);
                    if let Some(Slot::Ready(entry)) = state.slots.remove(&victim) {
                        trace!("cache evicting entry to admit a new one");
                        if let Some(hook) = &self.on_delete {
                            hook(entry.value);
                        }
                    }
                    continue;
                }

                drop(state);

                if wait_or_cancel(self.changed.notified(), cancel).await.is_err() {
                    return Err(Error::Cancelled);
                }

                continue;
            }

            self.misses.fetch_add(1, Ordering::Relaxed);

            let flight = Arc::new(CreateSlot {
                done: Notify::new(),
                result: Mutex::new(None),
            });
            state.slots.insert(key.clone(), Slot::Creating(flight.clone()));
            state.in_flight += 1;
            drop(state);

            let creator = create.take().expect("create called only once per flight");
            let outcome = creator().await;

            let mut state = self.state.lock().await;
            state.in_flight -= 1;

            match outcome {
                Ok(value) => {
                    let value = Arc::new(value);
                    *flight.result.lock().await = Some(Ok(value.clone()));
                    state
                        .slots
                        .insert(key.clone(), Slot::Ready(ReadyEntry { value: value.clone(), leases: 1 }));
                    drop(state);
                    flight.done.notify_waiters();
                    self.changed.notify_waiters();
                    return Ok(Lease { key, value });
                }
                Err(e) => {
                    *flight.result.lock().await = Some(Err(e.to_string()));
                    state.slots.remove(&key);
                    drop(state);
                    flight.done.notify_waiters();
                    self.changed.notify_waiters();
                    return Err(e);
                }
            }
        }
    }

    /// Decrements the entry's lease count; at zero it becomes eligible
    /// for eviction (or is evicted immediately if the cache is closed).
    pub async fn release(&self, lease: Lease<K, V>) {
        let mut state = self.state.lock().await;
        let key = lease.key.clone();
        drop(lease);

        let became_zero = if let Some(Slot::Ready(entry)) = state.slots.get_mut(&key) {
            entry.leases = entry.leases.saturating_sub(1);
            entry.leases == 0
        } else {
            false
        };

        if became_zero {
            if state.closed {
                if let Some(Slot::Ready(entry)) = state.slots.remove(&key) {
                    if let Some(hook) = &self.on_delete {
                        hook(entry.value);
                    }
                }
            } else {
                state.evictable.push(key);
            }
            self.changed.notify_waiters();
        }
    }

    /// Evicts every unreferenced entry, denies new `get_or_create` calls,
    /// and ensures future `release` calls on already-leased entries still
    /// deliver `on_delete` once their count reaches zero.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;

        for key in std::mem::take(&mut state.evictable) {
            if let Some(Slot::Ready(entry)) = state.slots.remove(&key) {
                if let Some(hook) = &self.on_delete {
                    hook(entry.value);
                }
            }
        }

        debug!("cache closed");
        self.changed.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.state.lock().await.slots.len(),
        }
    }
}

async fn wait_or_cancel(
    fut: impl Future<Output = ()>,
    cancel: &CancellationToken,
) -> std::result::Result<(), ()> {
    tokio::select! {
        _ = fut => Ok(()),
        _ = cancel.cancelled() => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn get_or_create_then_release() {
        let cache: LruCache<u32, String> = LruCache::new(4);
        let cancel = CancellationToken::new();

        let lease = cache
            .get_or_create(1, || async { Ok("hello".to_string()) }, &cancel)
            .await
            .unwrap();
        assert_eq!(lease.value().as_str(), "hello");
        cache.release(lease).await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn singleflight_creates_once() {
        let cache: Arc<LruCache<u32, u32>> = Arc::new(LruCache::new(4));
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create(
                        42,
                        || {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                Ok(7u32)
                            }
                        },
                        &cancel,
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut leases = Vec::new();
        for h in handles {
            leases.push(h.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(leases.iter().all(|l| Arc::ptr_eq(l.value(), leases[0].value())));

        for lease in leases {
            cache.release(lease).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn capacity_evicts_unreferenced_entries() {
        let cache: LruCache<u32, u32> = LruCache::new(1);
        let cancel = CancellationToken::new();

        let lease1 = cache
            .get_or_create(1, || async { Ok(1) }, &cancel)
            .await
            .unwrap();
        cache.release(lease1).await;

        let lease2 = cache
            .get_or_create(2, || async { Ok(2) }, &cancel)
            .await
            .unwrap();
        assert_eq!(*lease2.value().as_ref(), 2);
        assert_eq!(cache.len().await, 1);
        cache.release(lease2).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_get_or_create_honors_cancellation() {
        let cache: LruCache<u32, u32> = LruCache::new(1);
        let cancel = CancellationToken::new();

        let lease1 = cache
            .get_or_create(1, || async { Ok(1) }, &cancel)
            .await
            .unwrap();

        cancel.cancel();
        let err = cache
            .get_or_create(2, || async { Ok(2) }, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        cache.release(lease1).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metrics_count_hits_and_misses() {
        let cache: LruCache<u32, u32> = LruCache::new(4);
        let cancel = CancellationToken::new();

        let lease1 = cache.get_or_create(1, || async { Ok(1) }, &cancel).await.unwrap();
        let lease2 = cache.get_or_create(1, || async { Ok(1) }, &cancel).await.unwrap();

        let metrics = cache.metrics().await;
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.entries, 1);

        cache.release(lease1).await;
        cache.release(lease2).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_denies_new_entries_and_runs_on_delete_post_close() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let deleted_clone = deleted.clone();
        let cache: LruCache<u32, u32> = LruCache::with_on_delete(
            4,
            Some(Box::new(move |_| {
                deleted_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let cancel = CancellationToken::new();

        let lease = cache
            .get_or_create(1, || async { Ok(1) }, &cancel)
            .await
            .unwrap();
        cache.close().await;
        assert_eq!(deleted.load(Ordering::SeqCst), 0);

        cache.release(lease).await;
        assert_eq!(deleted.load(Ordering::SeqCst), 1);

        let err = cache
            .get_or_create(2, || async { Ok(2) }, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
