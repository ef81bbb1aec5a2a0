//! Chunk provider: opens/closes chunks on demand via
//! the releasable LRU cache, enforcing an FD/VMA budget.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use solaris_common::error::{Error, Result};
use solaris_common::model::ChunkId;

use crate::cache::{CacheMetrics, Lease, LruCache};
use crate::chunk::{ChunkFile, ChunkSizing};

/// `<root>/<last-two-chars-of-chunk-id>/<chunk-id>`.
pub fn chunk_path(root: &Path, id: ChunkId) -> PathBuf {
    root.join(id.shard()).join(id.to_string())
}

pub struct ChunkProvider {
    root: PathBuf,
    sizing: ChunkSizing,
    full_check: bool,
    recover_corrupted: bool,
    cache: LruCache<ChunkId, ChunkFile>,
}

impl ChunkProvider {
    pub fn new(root: impl Into<PathBuf>, sizing: ChunkSizing, max_open_chunks: usize) -> Self {
        Self::with_options(root, sizing, max_open_chunks, false, true)
    }

    /// `full_check` gates the open-time integrity scan (expensive on large
    /// chunks, so callers typically only ask for it in tests or recovery
    /// tooling). `recover_corrupted` gates a delete-and-retry heuristic for
    /// a chunk found corrupted at open time; defaults to on.
    pub fn with_options(
        root: impl Into<PathBuf>,
        sizing: ChunkSizing,
        max_open_chunks: usize,
        full_check: bool,
        recover_corrupted: bool,
    ) -> Self {
        let on_delete: Box<dyn Fn(Arc<ChunkFile>) + Send + Sync> = Box::new(|chunk| {
            if let Ok(chunk) = Arc::try_unwrap(chunk) {
                chunk.close();
            }
        });

        Self {
            root: root.into(),
            sizing,
            full_check,
            recover_corrupted,
            cache: LruCache::with_on_delete(max_open_chunks, Some(on_delete)),
        }
    }

    /// Opens (or creates, if `create_new`) chunk `id`, returning a lease
    /// that must later be passed to [`Self::release`]. Concurrent callers
    /// for the same id are deduplicated by the cache's singleflight.
    pub async fn get(
        &self,
        id: ChunkId,
        create_new: bool,
        cancel: &CancellationToken,
    ) -> Result<Lease<ChunkId, ChunkFile>> {
        let root = self.root.clone();
        let sizing = self.sizing;
        let full_check = self.full_check;
        let recover_corrupted = self.recover_corrupted;

        self.cache
            .get_or_create(
                id,
                move || async move {
                    let path = chunk_path(&root, id);

                    if !create_new && !path.exists() {
                        return Err(Error::not_exist(format!("chunk {id} does not exist")));
                    }

                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }

                    match ChunkFile::open(&path, sizing, full_check) {
                        Ok(chunk) => Ok(chunk),
                        Err(Error::Corrupted(msg)) if recover_corrupted => {
                            warn!(chunk = %id, reason = %msg, "chunk corrupted, deleting and recreating");
                            std::fs::remove_file(&path).ok();
                            ChunkFile::open(&path, sizing, full_check)
                        }
                        Err(e) => Err(e),
                    }
                },
                cancel,
            )
            .await
    }

    pub async fn release(&self, lease: Lease<ChunkId, ChunkFile>) {
        self.cache.release(lease).await;
    }

    pub async fn close(&self) {
        self.cache.close().await;
    }

    pub async fn open_count(&self) -> usize {
        self.cache.len().await
    }

    pub async fn metrics(&self) -> CacheMetrics {
        self.cache.metrics().await
    }
}
