//! Data model shared by every component of the core.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub Ulid);

impl LogId {
    pub fn new() -> Self {
        LogId(Ulid::new())
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub Ulid);

impl ChunkId {
    pub fn new() -> Self {
        ChunkId(Ulid::new())
    }

    /// Last two characters of the id, used to bucket chunk files and
    /// blob store keys into shard directories.
    pub fn shard(&self) -> String {
        let encoded = self.0.to_string_encoded();
        encoded[encoded.len() - 2..].to_string()
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable triple `(ID, LogID, Payload)`. `created_at` is derived from
/// the time component of `id`, never stored separately.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: Ulid,
    pub log_id: LogId,
    pub payload: Bytes,
}

impl Record {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.id.created_at()
    }
}

/// `(ID, Tags, CreatedAt, UpdatedAt, Deleted)` per `Tags` is
/// opaque to the append/merge path; only [`crate::query::QueryEvaluator`]
/// interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub id: LogId,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
}

impl Log {
    pub fn new(tags: BTreeMap<String, String>) -> Self {
        let now = Utc::now();

        Self {
            id: LogId::new(),
            tags,
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }
}

/// Descriptor `(ID, Min, Max, RecordsCount)`. Chunk ids are
/// themselves ULIDs, assigned at chunk creation and lexicographically
/// ordered (invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub id: ChunkId,
    pub min: Ulid,
    pub max: Ulid,
    pub records_count: u32,
}

impl ChunkInfo {
    pub fn empty(id: ChunkId) -> Self {
        Self {
            id,
            min: Ulid::MAX,
            max: Ulid::MIN,
            records_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records_count == 0
    }

    pub fn contains(&self, id: Ulid) -> bool {
        !self.is_empty() && id >= self.min && id <= self.max
    }
}

/// Ascending vs. descending iteration direction, shared by the chunk
/// reader, local log engine and merge iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn is_ascending(self) -> bool {
        matches!(self, Direction::Ascending)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryRequest {
    pub start_id: Ulid,
    pub direction: Direction,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub records: Vec<Record>,
    pub has_more: bool,
}
