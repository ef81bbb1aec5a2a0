//! Background orphan-chunk scan: finds chunk files written to disk whose
//! `upsert_chunk_infos` call never landed, crash residue left between a
//! chunk write and its metadata commit. A plain function a caller can run
//! periodically, not an owned scheduler, over the two-level
//! `<root>/<last-two-chars>/<id>` layout chunk files are stored under.

use std::collections::HashSet;
use std::path::Path;

use solaris_common::error::Result;
use solaris_common::metadata::{LogQuery, MetadataStore};
use solaris_common::model::ChunkId;
use solaris_common::ulid::Ulid;

/// Lists on-disk chunk files under `root` that no log's chunk list
/// references. Walks every shard subdirectory (`<root>/<last-two-chars>`)
/// looking for filenames that parse as a [`Ulid`]; anything not present in
/// any log's chunk set is returned as an orphan.
pub async fn scan_orphans(root: &Path, metadata: &dyn MetadataStore) -> Result<Vec<ChunkId>> {
    let mut referenced: HashSet<ChunkId> = HashSet::new();

    let logs = metadata
        .query_logs(LogQuery {
            include_deleted: true,
            ..LogQuery::default()
        })
        .await?;

    for log in logs {
        for chunk in metadata.get_chunks(log.id).await? {
            referenced.insert(chunk.id);
        }
    }

    let mut orphans = Vec::new();

    let Ok(shards) = std::fs::read_dir(root) else {
        return Ok(orphans);
    };

    for shard in shards.flatten() {
        if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        let Ok(files) = std::fs::read_dir(shard.path()) else {
            continue;
        };

        for file in files.flatten() {
            let Some(name) = file.file_name().to_str().map(str::to_string) else {
                continue;
            };

            let Ok(ulid) = Ulid::from_string_encoded(&name) else {
                continue;
            };

            let id = ChunkId(ulid);
            if !referenced.contains(&id) {
                orphans.push(id);
            }
        }
    }

    Ok(orphans)
}
