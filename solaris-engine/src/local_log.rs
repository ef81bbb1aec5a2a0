//! Local log engine: maps a log to an ordered list of
//! chunks, serializes appends per log, routes writes across chunk
//! boundaries, and answers forward/backward range queries.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use solaris_common::error::{Error, Result};
use solaris_common::metadata::MetadataStore;
use solaris_common::model::{ChunkId, ChunkInfo, Direction, LogId, QueryRequest, QueryResponse, Record};
use solaris_common::ulid::{MonotonicGenerator, Ulid};

use solaris_storage::{ChunkAccessorFsm, ChunkProvider};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Clamps the per-query record limit (`MaxRecordsLimit`).
    pub max_records_limit: usize,
    /// Max payload bytes appended to one chunk before rolling over
    /// (`MaxBunchSize`).
    pub max_bunch_size: usize,
    /// Capacity of the per-log lock cache (`MaxLocks`).
    pub max_locks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_records_limit: 1000,
            max_bunch_size: 4 * 1024 * 1024,
            max_locks: 1024,
        }
    }
}

/// Result of [`LocalLogEngine::append_records`]. A partial success
/// (`added > 0`) with a suppressed underlying error is intentional:
/// once bytes are durable on disk, losing the caller's cancellation
/// should not un-durable them.
#[derive(Debug, Clone, Copy)]
pub struct RecordBatch {
    pub added: usize,
}

pub struct LocalLogEngine {
    metadata: Arc<dyn MetadataStore>,
    provider: Arc<ChunkProvider>,
    fsm: Arc<ChunkAccessorFsm>,
    /// Per-log locks, keyed by log id. The cache's capacity doubles as
    /// the "maximum concurrent addressable logs" admission limiter; the
    /// `AsyncMutex` inside each entry gives actual per-log mutual
    /// exclusion for appenders.
    locks: solaris_storage::LruCache<LogId, AsyncMutex<()>>,
    config: EngineConfig,
}

impl LocalLogEngine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        provider: Arc<ChunkProvider>,
        fsm: Arc<ChunkAccessorFsm>,
        config: EngineConfig,
    ) -> Self {
        Self {
            metadata,
            provider,
            fsm,
            locks: solaris_storage::LruCache::new(config.max_locks),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Appends `records` to `log_id`, routing across chunk boundaries as
    /// needed. IDs are assigned here; the caller supplies only payload
    /// bytes.
    pub async fn append_records(
        &self,
        log_id: LogId,
        records: Vec<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<RecordBatch> {
        if records.is_empty() {
            return Ok(RecordBatch { added: 0 });
        }

        let lock_lease = self.locks.get_or_create(log_id, || async { Ok(AsyncMutex::new(())) }, cancel).await?;
        let _guard = lock_lease.value().lock().await;

        let result = self.append_locked(log_id, &records, cancel).await;
        self.locks.release(lock_lease).await;
        result
    }

    async fn append_locked(
        &self,
        log_id: LogId,
        records: &[Bytes],
        cancel: &CancellationToken,
    ) -> Result<RecordBatch> {
        let mut touched: Vec<ChunkInfo> = Vec::new();
        let mut added = 0usize;
        let mut remaining = records;

        let last_chunk = self.metadata.get_last_chunk(log_id).await?;
        let mut current_chunk_id = last_chunk.map(|c| c.id);
        let mut global_floor = last_chunk.filter(|c| !c.is_empty()).map(|c| c.max);

        let mut loop_error: Option<Error> = None;

        'outer: while !remaining.is_empty() {
            let (chunk_id, is_new) = match current_chunk_id.take() {
                Some(id) => (id, false),
                None => (ChunkId::new(), true),
            };

            if let Err(e) = self.fsm.set_writing(chunk_id, cancel).await {
                loop_error = Some(e);
                break;
            }

            let lease = match self.provider.get(chunk_id, is_new, cancel).await {
                Ok(lease) => lease,
                Err(e) => {
                    self.fsm.set_idle(chunk_id).await;
                    loop_error = Some(e);
                    break;
                }
            };

            let mut generator = MonotonicGenerator::new();
            let outcome = lease
                .value()
                .append_records(remaining, self.config.max_bunch_size, &mut generator, global_floor);

            self.provider.release(lease).await;
            self.fsm.set_idle(chunk_id).await;

            match outcome {
                Ok(outcome) => {
                    global_floor = Some(outcome.last_id);
                    added += outcome.written;

                    let info = touched
                        .iter_mut()
                        .find(|c| c.id == chunk_id)
                        .map(|c| {
                            c.max = outcome.last_id;
                            c.records_count += outcome.written as u32;
                        });

                    if info.is_none() {
                        let records_count = if is_new {
                            outcome.written as u32
                        } else {
                            // merge with the metadata-known count for this chunk
                            self.chunk_known_count(log_id, chunk_id).await + outcome.written as u32
                        };

                        touched.push(ChunkInfo {
                            id: chunk_id,
                            min: if is_new {
                                outcome.start_id
                            } else {
                                self.chunk_known_min(log_id, chunk_id).await.unwrap_or(outcome.start_id)
                            },
                            max: outcome.last_id,
                            records_count,
                        });
                    }

                    remaining = &remaining[outcome.written..];

                    if outcome.written == 0 && is_new {
                        loop_error = Some(Error::invalid("payload exceeds chunk capacity"));
                        break 'outer;
                    }

                    // chunk still has room and we consumed everything: done.
                    if remaining.is_empty() {
                        break 'outer;
                    }

                    // rolled over implicitly: next loop iteration opens a
                    // fresh chunk since current_chunk_id stays None.
                }
                Err(Error::Exhausted(_)) => {
                    // This chunk is full; force a fresh chunk next iteration
                    // without consuming any input.
                    current_chunk_id = None;
                    continue 'outer;
                }
                Err(e) => {
                    loop_error = Some(e);
                    break 'outer;
                }
            }
        }

        if !touched.is_empty() {
            // Deliberately takes no `cancel` token: a cancelled append
            // context must not abandon chunk bytes already durable on disk.
            if let Err(e) = self.metadata.upsert_chunk_infos(log_id, touched).await {
                error!(log = %log_id, error = %e, "fatal: chunk bytes written but upsert_chunk_infos failed");
                std::process::abort();
            }
        }

        match loop_error {
            Some(e) if added > 0 => {
                warn!(log = %log_id, error = %e, added, "append partially succeeded; suppressing error");
                Ok(RecordBatch { added })
            }
            Some(e) => Err(e),
            None => Ok(RecordBatch { added }),
        }
    }

    async fn chunk_known_count(&self, log_id: LogId, chunk_id: ChunkId) -> u32 {
        self.metadata
            .get_chunks(log_id)
            .await
            .ok()
            .and_then(|chunks| chunks.into_iter().find(|c| c.id == chunk_id))
            .map(|c| c.records_count)
            .unwrap_or(0)
    }

    async fn chunk_known_min(&self, log_id: LogId, chunk_id: ChunkId) -> Option<Ulid> {
        self.metadata
            .get_chunks(log_id)
            .await
            .ok()
            .and_then(|chunks| chunks.into_iter().find(|c| c.id == chunk_id))
            .map(|c| c.min)
    }

    /// Answers a forward/backward range query.
    /// A chunk removed between the metadata read and the open (raced
    /// deletion/replication) surfaces as `NotExist` internally; the
    /// records collected so far are returned rather than discarded, the
    /// same partial-success policy as [`Self::append_records`].
    pub async fn query_records(&self, log_id: LogId, request: QueryRequest, cancel: &CancellationToken) -> Result<QueryResponse> {
        // Per-log lease bounds concurrent addressable logs; queries never
        // take the per-log mutex (no exclusion with appenders).
        let lease = self.locks.get_or_create(log_id, || async { Ok(AsyncMutex::new(())) }, cancel).await?;
        self.locks.release(lease).await;

        let limit = request.limit.min(self.config.max_records_limit).max(1);
        let descending = matches!(request.direction, Direction::Descending);

        let chunks = self.metadata.get_chunks(log_id).await?;
        if chunks.is_empty() {
            return Ok(QueryResponse { records: Vec::new(), has_more: false });
        }

        let start_index = find_start_index(&chunks, request.start_id, descending);
        let Some(mut index) = start_index else {
            return Ok(QueryResponse { records: Vec::new(), has_more: false });
        };

        let mut records = Vec::with_capacity(limit.min(256));
        let mut has_more = false;
        let mut first = true;

        loop {
            if index >= chunks.len() {
                break;
            }

            let chunk_id = chunks[index].id;

            let open_result = async {
                self.fsm.open_chunk(chunk_id, cancel).await?;
                let lease = self.provider.get(chunk_id, false, cancel).await?;
                Ok::<_, Error>(lease)
            }
            .await;

            let lease = match open_result {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(log = %log_id, chunk = %chunk_id, error = %e, "query: chunk open failed, returning partial results");
                    break;
                }
            };

            let mut reader = match lease.value().open_reader(descending) {
                Ok(r) => r,
                Err(e) => {
                    self.provider.release(lease).await;
                    self.fsm.close_chunk(chunk_id).await;
                    warn!(log = %log_id, chunk = %chunk_id, error = %e, "query: open_reader failed, returning partial results");
                    break;
                }
            };

            if first {
                reader.set_start_id(request.start_id)?;
                first = false;
            }

            use solaris_common::iterator::IteratorIO;
            while records.len() < limit {
                match reader.next()? {
                    Some((id, payload)) => records.push(Record { id, log_id, payload }),
                    None => break,
                }
            }

            let limit_reached = records.len() >= limit;
            // Peek one further entry to tell "limit hit exactly as the last
            // chunk ran out" (has_more = false) from "limit hit with data
            // still behind it" (has_more = true).
            let more_in_this_chunk = limit_reached && reader.next()?.is_some();

            reader.close();
            self.provider.release(lease).await;
            self.fsm.close_chunk(chunk_id).await;

            if limit_reached {
                has_more = more_in_this_chunk || chunk_has_more(&chunks, index, descending);
                break;
            }

            index = if descending {
                match index.checked_sub(1) {
                    Some(i) => i,
                    None => break,
                }
            } else {
                index + 1
            };
        }

        Ok(QueryResponse { records, has_more })
    }
}

fn chunk_has_more(chunks: &[ChunkInfo], index: usize, descending: bool) -> bool {
    if descending {
        index > 0
    } else {
        index + 1 < chunks.len()
    }
}

/// Binary search for the first chunk (ascending) or last chunk
/// (descending) that could contain `start_id`.
fn find_start_index(chunks: &[ChunkInfo], start_id: Ulid, descending: bool) -> Option<usize> {
    if descending {
        let idx = chunks.partition_point(|c| c.min <= start_id);
        if idx == 0 {
            None
        } else {
            Some(idx - 1)
        }
    } else {
        let idx = chunks.partition_point(|c| c.max < start_id);
        if idx == chunks.len() {
            None
        } else {
            Some(idx)
        }
    }
}
