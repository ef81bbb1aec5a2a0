//! Metadata store contract. The core only depends on
//! this trait; concrete backends (in-memory, sorted-KV) are injected at
//! construction.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ChunkInfo, Log, LogId};

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub ids: Option<Vec<LogId>>,
    /// Opaque predicate serialized by the out-of-scope tag-query language;
    /// the core never interprets it itself (see [`crate::query`]).
    pub condition: Option<String>,
    pub page: u32,
    pub limit: u32,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteLogsRequest {
    pub ids: Option<Vec<LogId>>,
    pub condition: Option<String>,
    /// Soft-delete (set the hidden flag) vs. hard-delete (cascade removal
    /// of chunk infos and, by the caller, local chunk files).
    pub mark_only: bool,
}

/// The contract requires atomicity of a single `upsert_chunk_infos` call
/// (all-or-nothing); `get_last_chunk`/`get_chunks` must reflect the most
/// recent successful upsert.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_log(&self, log: Log) -> Result<Log>;
    async fn get_log_by_id(&self, id: LogId) -> Result<Log>;
    async fn update_log(&self, log: Log) -> Result<Log>;
    async fn query_logs(&self, query: LogQuery) -> Result<Vec<Log>>;
    async fn delete_logs(&self, request: DeleteLogsRequest) -> Result<u64>;

    async fn get_last_chunk(&self, log_id: LogId) -> Result<Option<ChunkInfo>>;
    async fn get_chunks(&self, log_id: LogId) -> Result<Vec<ChunkInfo>>;
    async fn upsert_chunk_infos(&self, log_id: LogId, infos: Vec<ChunkInfo>) -> Result<()>;
}
