//! Chunk accessor state machine: per-chunk-id state in
//! `{Idle, Writing, Deleting}` plus an `opened` flag held by the provider
//! while a chunk is mapped. Coordinates local reads/writes against
//! the replicator. Waiters block on per-entry notify channels
//! created lazily.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use solaris_common::error::{Error, Result};
use solaris_common::model::ChunkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Writing,
    Deleting,
}

struct Entry {
    state: State,
    opened: bool,
}

pub struct ChunkAccessorFsm {
    entries: Mutex<HashMap<ChunkId, Entry>>,
    notifies: Mutex<HashMap<ChunkId, Arc<Notify>>>,
    closed: Mutex<bool>,
}

impl Default for ChunkAccessorFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAccessorFsm {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            notifies: Mutex::new(HashMap::new()),
            closed: Mutex::new(false),
        }
    }

    async fn notify_for(&self, id: ChunkId) -> Arc<Notify> {
        self.notifies
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    async fn wake(&self, id: ChunkId) {
        self.notify_for(id).await.notify_waiters();
    }

    /// Blocks while `Writing`; fails [`Error::NotExist`] if `Deleting`.
    /// Sets `opened = true` once it proceeds.
    pub async fn open_chunk(&self, id: ChunkId, cancel: &CancellationToken) -> Result<()> {
        loop {
            if *self.closed.lock().await {
                return Err(Error::Closed);
            }

            let notify = self.notify_for(id).await;
            let mut entries = self.entries.lock().await;

            match entries.get(&id).map(|e| e.state) {
                Some(State::Deleting) => return Err(Error::not_exist(format!("chunk {id} is being deleted"))),
                Some(State::Writing) => {
                    // Register for the wakeup while still holding `entries`
                    // so a concurrent `set_idle`/`close_chunk` can't fire
                    // `notify_waiters` in the gap between observing `Writing`
                    // and starting to wait (`Notify` stores no permit).
                    let fut = notify.notified();
                    drop(entries);
                    wait_or_cancel(fut, cancel).await?;
                    continue;
                }
                Some(State::Idle) | None => {
                    entries.entry(id).or_insert(Entry { state: State::Idle, opened: false }).opened = true;
                    return Ok(());
                }
            }
        }
    }

    /// Clears `opened`; removes the entry entirely if it is `Idle`.
    pub async fn close_chunk(&self, id: ChunkId) {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&id) {
            entry.opened = false;

            if entry.state == State::Idle {
                entries.remove(&id);
            }
        }

        drop(entries);
        self.wake(id).await;
    }

    /// Blocks while `Writing` or `Deleting`; fails [`Error::NotExist`] if
    /// `Deleting`. Otherwise transitions `Idle -> Writing`.
    pub async fn set_writing(&self, id: ChunkId, cancel: &CancellationToken) -> Result<()> {
        loop {
            if *self.closed.lock().await {
                return Err(Error::Closed);
            }

            let notify = self.notify_for(id).await;
            let mut entries = self.entries.lock().await;

            match entries.get(&id).map(|e| e.state) {
                Some(State::Deleting) => return Err(Error::not_exist(format!("chunk {id} is being deleted"))),
                Some(State::Writing) => {
                    // See `open_chunk`: register before releasing `entries`
                    // to avoid racing a concurrent wakeup.
                    let fut = notify.notified();
                    drop(entries);
                    wait_or_cancel(fut, cancel).await?;
                    continue;
                }
                Some(State::Idle) | None => {
                    let entry = entries.entry(id).or_insert(Entry { state: State::Idle, opened: false });
                    entry.state = State::Writing;
                    trace!(%id, "chunk fsm: idle -> writing");
                    return Ok(());
                }
            }
        }
    }

    /// Succeeds only if no entry exists for `id` (no reader, no writer).
    pub async fn set_deleting(&self, id: ChunkId) -> bool {
        let mut entries = self.entries.lock().await;

        if entries.contains_key(&id) {
            return false;
        }

        entries.insert(id, Entry { state: State::Deleting, opened: false });
        true
    }

    /// Drops back to `Idle`, waking any waiter.
    pub async fn set_idle(&self, id: ChunkId) {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(&id) {
                entry.state = State::Idle;
                if !entry.opened {
                    entries.remove(&id);
                }
            }
        }
        self.wake(id).await;
    }

    /// Denies new transitions with [`Error::Closed`] and wakes every
    /// waiter so blocked calls can observe it.
    pub async fn close(&self) {
        *self.closed.lock().await = true;

        let ids: Vec<ChunkId> = self.entries.lock().await.keys().copied().collect();
        for id in ids {
            self.wake(id).await;
        }
    }
}

async fn wait_or_cancel(fut: impl Future<Output = ()>, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = fut => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id() -> ChunkId {
        ChunkId::new()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_then_close_removes_idle_entry() {
        let fsm = ChunkAccessorFsm::new();
        let cancel = CancellationToken::new();
        let id = id();

        fsm.open_chunk(id, &cancel).await.unwrap();
        fsm.close_chunk(id).await;
        assert!(fsm.entries.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_writing_blocks_open_chunk() {
        let fsm = Arc::new(ChunkAccessorFsm::new());
        let cancel = CancellationToken::new();
        let id = id();

        fsm.set_writing(id, &cancel).await.unwrap();

        let fsm2 = fsm.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { fsm2.open_chunk(id, &cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        fsm.set_idle(id).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_deleting_fails_once_opened() {
        let fsm = ChunkAccessorFsm::new();
        let cancel = CancellationToken::new();
        let id = id();

        fsm.open_chunk(id, &cancel).await.unwrap();
        assert!(!fsm.set_deleting(id).await);

        fsm.close_chunk(id).await;
        assert!(fsm.set_deleting(id).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_chunk_fails_on_deleting() {
        let fsm = ChunkAccessorFsm::new();
        let cancel = CancellationToken::new();
        let id = id();

        assert!(fsm.set_deleting(id).await);
        let err = fsm.open_chunk(id, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::NotExist(_)));
    }
}
