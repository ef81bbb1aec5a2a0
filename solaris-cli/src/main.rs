mod config;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use solaris_common::metadata::MetadataStore;
use solaris_common::model::{Direction, Log, QueryRequest};
use solaris_common::ulid::Ulid;
use solaris_engine::{InMemoryMetadataStore, LocalLogEngine};
use solaris_storage::{ChunkAccessorFsm, ChunkProvider};

use config::Config;

/// Demo binary: creates a log, appends a handful of records, and reads
/// them back, exercising the engine end to end.
#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::load()?;
    std::fs::create_dir_all(&config.data_dir)?;

    let provider = Arc::new(ChunkProvider::new(config.data_dir.clone(), config.chunk_sizing(), config.provider_max_open_chunks));
    let fsm = Arc::new(ChunkAccessorFsm::new());
    let metadata: Arc<InMemoryMetadataStore> = Arc::new(InMemoryMetadataStore::new());
    let engine = Arc::new(LocalLogEngine::new(metadata.clone(), provider.clone(), fsm, config.engine_config()));

    let mut tags = BTreeMap::new();
    tags.insert("demo".to_string(), "quickstart".to_string());
    let log = metadata.create_log(Log::new(tags)).await?;
    tracing::info!(log = %log.id, "created demo log");

    let cancel = CancellationToken::new();
    let payloads: Vec<Bytes> = (0..10).map(|i| Bytes::from(format!("hello #{i}"))).collect();

    let batch = engine.append_records(log.id, payloads, &cancel).await?;
    tracing::info!(added = batch.added, "appended records");

    let response = engine
        .query_records(
            log.id,
            QueryRequest { start_id: Ulid::MIN, direction: Direction::Ascending, limit: 100 },
            &cancel,
        )
        .await?;

    for record in &response.records {
        println!("{} -> {}", record.id, String::from_utf8_lossy(&record.payload));
    }

    provider.close().await;
    Ok(())
}
