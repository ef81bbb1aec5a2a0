//! The hard engineering: a memory-mapped chunk file format,
//! a releasable LRU cache with singleflight, a chunk
//! provider, the per-chunk accessor state machine and a
//! replicator that moves zipped chunks to/from a blob store.

pub mod blobstore;
pub mod cache;
pub mod chunk;
pub mod constants;
pub mod fsm;
pub mod mmap;
pub mod provider;
pub mod replicator;

pub use blobstore::BlobStore;
pub use cache::{CacheMetrics, Lease, LruCache};
pub use chunk::{AppendOutcome, ChunkFile, ChunkReader, ChunkSizing};
pub use fsm::ChunkAccessorFsm;
pub use mmap::MemoryMappedFile;
pub use provider::ChunkProvider;
pub use provider::chunk_path;
pub use replicator::{DeleteFlags, DownloadFlags, Replicator};
