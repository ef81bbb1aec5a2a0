pub mod error;
pub mod iterator;
pub mod metadata;
pub mod model;
pub mod query;
pub mod ulid;

pub use error::{Error, Result};
pub use iterator::IteratorIO;
pub use model::{ChunkId, ChunkInfo, Direction, Log, LogId, QueryRequest, QueryResponse, Record};
pub use ulid::Ulid;
