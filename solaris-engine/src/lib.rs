//! The composition layer: the local log engine, the
//! cross-log merge iterator, the per-log paginated record iterator,
//! an in-memory reference [`MetadataStore`](solaris_common::metadata::MetadataStore)
//! implementation, tag-query log selection, and the
//! background orphan-chunk scan.

pub mod local_log;
pub mod merge;
pub mod metadata;
pub mod paginated;
pub mod scan;
pub mod selection;

pub use local_log::{EngineConfig, LocalLogEngine, RecordBatch};
pub use merge::{AsyncRecordIterator, MergeIterator};
pub use metadata::InMemoryMetadataStore;
pub use paginated::PaginatedIterator;
pub use scan::scan_orphans;
pub use selection::{select_logs, select_logs_arc};

#[cfg(test)]
mod tests;
