//! Per-log paginated iterator. Wraps
//! [`LocalLogEngine::query_records`] calls with an internal buffer, issuing
//! another page once the buffer is exhausted, the cursor advancing by
//! [`Ulid::next`]/[`Ulid::prev`] of the last emitted record's id.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use solaris_common::model::{Direction, LogId, QueryRequest, Record};
use solaris_common::ulid::Ulid;
use solaris_common::Result;

use crate::local_log::LocalLogEngine;
use crate::merge::AsyncRecordIterator;

/// Paginated, cancellation-aware stream over a single log.
/// On any underlying error it cancels `cancel_sink` so merge peers sharing
/// the same sink ("A shared cancellable context is passed to
/// every source; cancellation aborts the merge") shut down too.
pub struct PaginatedIterator {
    engine: Arc<LocalLogEngine>,
    log_id: LogId,
    direction: Direction,
    start_id: Ulid,
    cursor: Ulid,
    page_size: usize,
    buffer: VecDeque<Record>,
    /// `true` once a page came back with `has_more == false`; the buffer
    /// may still hold unread records at that point.
    exhausted: bool,
    cancel_sink: CancellationToken,
}

impl PaginatedIterator {
    pub fn new(
        engine: Arc<LocalLogEngine>,
        log_id: LogId,
        direction: Direction,
        start_id: Ulid,
        page_size: usize,
        cancel_sink: CancellationToken,
    ) -> Self {
        Self {
            engine,
            log_id,
            direction,
            start_id,
            cursor: start_id,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
            cancel_sink,
        }
    }

    async fn fill_page(&mut self) -> Result<()> {
        let request = QueryRequest {
            start_id: self.cursor,
            direction: self.direction,
            limit: self.page_size,
        };

        match self
            .engine
            .query_records(self.log_id, request, &self.cancel_sink)
            .await
        {
            Ok(response) => {
                if let Some(last) = response.records.last() {
                    self.cursor = match self.direction {
                        Direction::Ascending => last.id.next(),
                        Direction::Descending => last.id.prev(),
                    };
                }

                if !response.has_more {
                    self.exhausted = true;
                }

                self.buffer.extend(response.records);
                Ok(())
            }
            Err(e) => {
                self.cancel_sink.cancel();
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl AsyncRecordIterator for PaginatedIterator {
    async fn next(&mut self) -> Result<Option<Record>> {
        if self.cancel_sink.is_cancelled() {
            return Err(solaris_common::Error::Cancelled);
        }

        if self.buffer.is_empty() && !self.exhausted {
            self.fill_page().await?;
        }

        Ok(self.buffer.pop_front())
    }

    /// Clears the eof flag and rewinds the cursor to the iterator's
    /// original `start_id` (`Reset`); the cursor's semantics
    /// (advance by successor/predecessor) are unaffected.
    async fn reset(&mut self) -> Result<()> {
        self.cursor = self.start_id;
        self.buffer.clear();
        self.exhausted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;

    use crate::local_log::EngineConfig;
    use crate::metadata::InMemoryMetadataStore;
    use solaris_storage::{ChunkAccessorFsm, ChunkProvider, ChunkSizing};
    use temp_testdir::TempDir;

    async fn engine_with(dir: &TempDir) -> Arc<LocalLogEngine> {
        let sizing = ChunkSizing {
            new_size: 4096,
            max_chunk_size: 16384,
            max_grow_increase_size: 4096,
        };
        let provider = Arc::new(ChunkProvider::new(dir.to_path_buf(), sizing, 8));
        let fsm = Arc::new(ChunkAccessorFsm::new());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        Arc::new(LocalLogEngine::new(metadata, provider, fsm, EngineConfig::default()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pages_through_small_limits() {
        let dir = TempDir::default();
        let engine = engine_with(&dir).await;
        let log_id = LogId::new();
        let cancel = CancellationToken::new();

        let payloads: Vec<Bytes> = (0..7).map(|i| Bytes::from(vec![i as u8; 8])).collect();
        engine.append_records(log_id, payloads.clone(), &cancel).await.unwrap();

        let mut iter = PaginatedIterator::new(
            engine,
            log_id,
            Direction::Ascending,
            Ulid::MIN,
            2,
            CancellationToken::new(),
        );

        let mut seen = Vec::new();
        while let Some(record) = iter.next().await.unwrap() {
            seen.push(record.payload);
        }

        assert_eq!(seen, payloads);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_rewinds_to_start() {
        let dir = TempDir::default();
        let engine = engine_with(&dir).await;
        let log_id = LogId::new();
        let cancel = CancellationToken::new();

        let payloads: Vec<Bytes> = (0..3).map(|i| Bytes::from(vec![i as u8; 8])).collect();
        engine.append_records(log_id, payloads.clone(), &cancel).await.unwrap();

        let mut iter = PaginatedIterator::new(
            engine,
            log_id,
            Direction::Ascending,
            Ulid::MIN,
            10,
            CancellationToken::new(),
        );

        let first = iter.next().await.unwrap().unwrap();
        iter.reset().await.unwrap();
        let after_reset = iter.next().await.unwrap().unwrap();
        assert_eq!(first.payload, after_reset.payload);
    }
}
