use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use temp_testdir::TempDir;

use solaris_common::error::{Error, Result};
use solaris_common::metadata::{DeleteLogsRequest, LogQuery, MetadataStore};
use solaris_common::model::{ChunkInfo, Direction, Log, LogId, QueryRequest};
use solaris_storage::{ChunkAccessorFsm, ChunkProvider, ChunkSizing};

use crate::local_log::{EngineConfig, LocalLogEngine};
use crate::metadata::InMemoryMetadataStore;

fn small_sizing() -> ChunkSizing {
    ChunkSizing {
        new_size: 4096,
        max_chunk_size: 8192,
        max_grow_increase_size: 4096,
    }
}

fn engine(dir: &TempDir, config: EngineConfig) -> LocalLogEngine {
    let provider = Arc::new(ChunkProvider::new(dir.to_path_buf(), small_sizing(), 8));
    let fsm = Arc::new(ChunkAccessorFsm::new());
    let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    LocalLogEngine::new(metadata, provider, fsm, config)
}

/// Appends many fixed-size records under a small chunk budget and expects
/// a fixed chunk count whose record counts sum to the total. With
/// `MaxChunkSize=8192` and 1024-byte payloads, each chunk holds exactly 7
/// records (`k*(1024+24) <= 8192-32`), so 21 records is the smallest
/// input that divides evenly into exactly three chunks without leaving a
/// trailing partial chunk to complicate the assertion.
#[tokio::test(flavor = "multi_thread")]
async fn append_routes_across_three_chunks() {
    let dir = TempDir::default();
    let engine = engine(&dir, EngineConfig::default());
    let log_id = LogId::new();
    let cancel = CancellationToken::new();

    let payloads: Vec<Bytes> = (0..21).map(|i| Bytes::from(vec![i as u8; 1024])).collect();
    let batch = engine.append_records(log_id, payloads.clone(), &cancel).await.unwrap();
    assert_eq!(batch.added, 21);

    let chunks = engine.metadata().get_chunks(log_id).await.unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks.iter().map(|c| c.records_count as usize).sum::<usize>(), 21);

    let response = engine
        .query_records(
            log_id,
            QueryRequest {
                start_id: solaris_common::ulid::Ulid::MIN,
                direction: Direction::Ascending,
                limit: 21,
            },
            &cancel,
        )
        .await
        .unwrap();

    let seen: Vec<Bytes> = response.records.into_iter().map(|r| r.payload).collect();
    assert_eq!(seen, payloads);
}

/// Pages through one record at a time using each result's successor id
/// as the next `StartID`.
#[tokio::test(flavor = "multi_thread")]
async fn successor_cursor_pages_one_at_a_time() {
    let dir = TempDir::default();
    let engine = engine(&dir, EngineConfig::default());
    let log_id = LogId::new();
    let cancel = CancellationToken::new();

    let payloads = vec![
        Bytes::from_static(b"m1"),
        Bytes::from_static(b"m2"),
        Bytes::from_static(b"m3"),
    ];
    engine.append_records(log_id, payloads.clone(), &cancel).await.unwrap();

    let mut start_id = solaris_common::ulid::Ulid::MIN;
    let mut collected = Vec::new();

    for _ in 0..3 {
        let response = engine
            .query_records(
                log_id,
                QueryRequest { start_id, direction: Direction::Ascending, limit: 1 },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(response.records.len(), 1);
        let record = &response.records[0];
        collected.push(record.payload.clone());
        start_id = record.id.next();
    }

    assert_eq!(collected, payloads);
}

/// Descending query reverses insertion order; a `StartID` in the middle
/// yields the suffix up to (and including) it.
#[tokio::test(flavor = "multi_thread")]
async fn descending_query_and_seek() {
    let dir = TempDir::default();
    let engine = engine(&dir, EngineConfig::default());
    let log_id = LogId::new();
    let cancel = CancellationToken::new();

    let payloads = vec![
        Bytes::from_static(b"m1"),
        Bytes::from_static(b"m2"),
        Bytes::from_static(b"m3"),
    ];
    engine.append_records(log_id, payloads.clone(), &cancel).await.unwrap();

    let response = engine
        .query_records(
            log_id,
            QueryRequest {
                start_id: solaris_common::ulid::Ulid::MAX,
                direction: Direction::Descending,
                limit: 10,
            },
            &cancel,
        )
        .await
        .unwrap();
    let seen: Vec<Bytes> = response.records.iter().map(|r| r.payload.clone()).collect();
    assert_eq!(seen, vec![payloads[2].clone(), payloads[1].clone(), payloads[0].clone()]);

    let m2_id = response.records[1].id;
    let response = engine
        .query_records(
            log_id,
            QueryRequest { start_id: m2_id, direction: Direction::Descending, limit: 10 },
            &cancel,
        )
        .await
        .unwrap();
    let seen: Vec<Bytes> = response.records.iter().map(|r| r.payload.clone()).collect();
    assert_eq!(seen, vec![payloads[1].clone(), payloads[0].clone()]);
}

/// A record larger than `MaxChunkSize` is rejected on an empty chunk.
#[tokio::test(flavor = "multi_thread")]
async fn oversized_record_is_invalid() {
    let dir = TempDir::default();
    let engine = engine(&dir, EngineConfig::default());
    let log_id = LogId::new();
    let cancel = CancellationToken::new();

    let huge = Bytes::from(vec![0u8; small_sizing().max_chunk_size + 1]);
    let err = engine.append_records(log_id, vec![huge], &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

/// With `MaxLocks=1`, two concurrent appends to *different* log ids still
/// serialize, because the per-log lock cache's capacity (not log identity)
/// is what back-pressures. A metadata store that sleeps inside
/// `get_last_chunk` stands in for "work time" so the serialization is
/// observable in wall-clock terms.
#[tokio::test(flavor = "multi_thread")]
async fn single_lock_slot_serializes_different_logs() {
    struct SlowMetadataStore {
        inner: InMemoryMetadataStore,
        delay: Duration,
    }

    #[async_trait]
    impl MetadataStore for SlowMetadataStore {
        async fn create_log(&self, log: Log) -> Result<Log> {
            self.inner.create_log(log).await
        }
        async fn get_log_by_id(&self, id: LogId) -> Result<Log> {
            self.inner.get_log_by_id(id).await
        }
        async fn update_log(&self, log: Log) -> Result<Log> {
            self.inner.update_log(log).await
        }
        async fn query_logs(&self, query: LogQuery) -> Result<Vec<Log>> {
            self.inner.query_logs(query).await
        }
        async fn delete_logs(&self, request: DeleteLogsRequest) -> Result<u64> {
            self.inner.delete_logs(request).await
        }
        async fn get_last_chunk(&self, log_id: LogId) -> Result<Option<ChunkInfo>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_last_chunk(log_id).await
        }
        async fn get_chunks(&self, log_id: LogId) -> Result<Vec<ChunkInfo>> {
            self.inner.get_chunks(log_id).await
        }
        async fn upsert_chunk_infos(&self, log_id: LogId, infos: Vec<ChunkInfo>) -> Result<()> {
            self.inner.upsert_chunk_infos(log_id, infos).await
        }
    }

    let dir = TempDir::default();
    let delay = Duration::from_millis(60);
    let provider = Arc::new(ChunkProvider::new(dir.to_path_buf(), small_sizing(), 8));
    let fsm = Arc::new(ChunkAccessorFsm::new());
    let metadata: Arc<dyn MetadataStore> = Arc::new(SlowMetadataStore {
        inner: InMemoryMetadataStore::new(),
        delay,
    });
    let config = EngineConfig { max_locks: 1, ..EngineConfig::default() };
    let engine = Arc::new(LocalLogEngine::new(metadata, provider, fsm, config));

    let log_a = LogId::new();
    let log_b = LogId::new();
    let cancel = CancellationToken::new();

    let started = Instant::now();

    let engine_a = engine.clone();
    let cancel_a = cancel.clone();
    let task_a = tokio::spawn(async move {
        engine_a
            .append_records(log_a, vec![Bytes::from_static(b"a")], &cancel_a)
            .await
    });

    let engine_b = engine.clone();
    let cancel_b = cancel.clone();
    let task_b = tokio::spawn(async move {
        engine_b
            .append_records(log_b, vec![Bytes::from_static(b"b")], &cancel_b)
            .await
    });

    task_a.await.unwrap().unwrap();
    task_b.await.unwrap().unwrap();

    assert!(started.elapsed() >= delay * 2);
}

/// The upload/remove/download round trip is covered directly against the
/// replicator in `solaris_storage::replicator::tests`
/// (`upload_remove_download_restores_bytes`); the engine layer adds no
/// behavior on top of it.
