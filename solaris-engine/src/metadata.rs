//! In-memory reference implementation of the metadata store contract.
//! Exists for tests and the CLI demo; a sorted-KV-backed
//! implementation is an external collaborator left to the deployer.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use solaris_common::error::{Error, Result};
use solaris_common::metadata::{DeleteLogsRequest, LogQuery, MetadataStore};
use solaris_common::model::{ChunkInfo, Log, LogId};

#[derive(Default)]
pub struct InMemoryMetadataStore {
    logs: Mutex<HashMap<LogId, Log>>,
    chunks: Mutex<HashMap<LogId, Vec<ChunkInfo>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create_log(&self, log: Log) -> Result<Log> {
        let mut logs = self.logs.lock().await;

        if logs.contains_key(&log.id) {
            return Err(Error::Exist(format!("log {} already exists", log.id)));
        }

        logs.insert(log.id, log.clone());
        Ok(log)
    }

    async fn get_log_by_id(&self, id: LogId) -> Result<Log> {
        self.logs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_exist(format!("log {id} not found")))
    }

    async fn update_log(&self, mut log: Log) -> Result<Log> {
        let mut logs = self.logs.lock().await;

        if !logs.contains_key(&log.id) {
            return Err(Error::not_exist(format!("log {} not found", log.id)));
        }

        log.updated_at = Utc::now();
        logs.insert(log.id, log.clone());
        Ok(log)
    }

    async fn query_logs(&self, query: LogQuery) -> Result<Vec<Log>> {
        let logs = self.logs.lock().await;

        let mut matched: Vec<Log> = logs
            .values()
            .filter(|log| query.include_deleted || !log.deleted)
            .filter(|log| match &query.ids {
                Some(ids) => ids.contains(&log.id),
                None => true,
            })
            .cloned()
            .collect();

        matched.sort_by_key(|log| log.id);

        if query.limit == 0 {
            return Ok(matched);
        }

        let start = (query.page as usize) * query.limit as usize;
        Ok(matched
            .into_iter()
            .skip(start)
            .take(query.limit as usize)
            .collect())
    }

    async fn delete_logs(&self, request: DeleteLogsRequest) -> Result<u64> {
        let ids: Vec<LogId> = match request.ids {
            Some(ids) => ids,
            None => self.logs.lock().await.keys().copied().collect(),
        };

        let mut logs = self.logs.lock().await;
        let mut chunks = self.chunks.lock().await;
        let mut count = 0u64;

        for id in ids {
            if request.mark_only {
                if let Some(log) = logs.get_mut(&id) {
                    if !log.deleted {
                        log.deleted = true;
                        log.updated_at = Utc::now();
                        count += 1;
                    }
                }
            } else if logs.remove(&id).is_some() {
                chunks.remove(&id);
                count += 1;
            }
        }

        Ok(count)
    }

    async fn get_last_chunk(&self, log_id: LogId) -> Result<Option<ChunkInfo>> {
        Ok(self.chunks.lock().await.get(&log_id).and_then(|v| v.last().copied()))
    }

    async fn get_chunks(&self, log_id: LogId) -> Result<Vec<ChunkInfo>> {
        Ok(self.chunks.lock().await.get(&log_id).cloned().unwrap_or_default())
    }

    /// All-or-nothing: either every entry in `infos` lands or none do.
    /// Subsequent `get_last_chunk`/`get_chunks` calls observe the result
    /// atomically because both read under the same mutex this write holds.
    async fn upsert_chunk_infos(&self, log_id: LogId, infos: Vec<ChunkInfo>) -> Result<()> {
        let mut chunks = self.chunks.lock().await;
        let entry = chunks.entry(log_id).or_default();

        for info in infos {
            match entry.iter_mut().find(|c| c.id == info.id) {
                Some(existing) => *existing = info,
                None => entry.push(info),
            }
        }

        entry.sort_by_key(|c| c.id);
        Ok(())
    }
}
