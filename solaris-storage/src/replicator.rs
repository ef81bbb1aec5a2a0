//! Replicator: zips a chunk file and uploads/downloads/
//! deletes it against a [`BlobStore`], guarded by the chunk accessor FSM
//! so replication and local appends never run concurrently on the
//! same chunk. Zips with a single entry via the `zip` crate.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use solaris_common::error::{Error, Result};
use solaris_common::model::ChunkId;

use crate::blobstore::BlobStore;
use crate::fsm::ChunkAccessorFsm;
use crate::provider::chunk_path;

bitflags! {
    pub struct DownloadFlags: u8 {
        const REMOTE_SYNC = 0x1;
    }
}

bitflags! {
    pub struct DeleteFlags: u8 {
        const REMOTE_DELETE = 0x1;
        const REMOTE_SYNC = 0x2;
    }
}

pub struct Replicator {
    root: PathBuf,
    fsm: Arc<ChunkAccessorFsm>,
    blobs: Arc<dyn BlobStore>,
}

impl Replicator {
    pub fn new(root: impl Into<PathBuf>, fsm: Arc<ChunkAccessorFsm>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            root: root.into(),
            fsm,
            blobs,
        }
    }

    fn blob_key(&self, id: ChunkId) -> String {
        format!("/{}/{}", id.shard(), id)
    }

    /// Zips the local chunk file and uploads it to `/<shard>/<id>`.
    pub async fn upload(&self, id: ChunkId, cancel: &CancellationToken) -> Result<()> {
        self.fsm.set_writing(id, cancel).await?;
        let result = self.upload_inner(id).await;
        self.fsm.set_idle(id).await;
        result
    }

    async fn upload_inner(&self, id: ChunkId) -> Result<()> {
        let path = chunk_path(&self.root, id);
        let bytes = std::fs::read(&path)?;
        let zipped = zip_single_entry(&id.to_string(), &bytes)?;
        self.blobs.put(&self.blob_key(id), Bytes::from(zipped)).await?;
        debug!(chunk = %id, bytes = bytes.len(), "uploaded chunk");
        Ok(())
    }

    /// If `RemoteSync` is unset and the local file already exists, this is
    /// a no-op; otherwise fetches the zip and atomically replaces the
    /// local file.
    pub async fn download(&self, id: ChunkId, flags: DownloadFlags, cancel: &CancellationToken) -> Result<()> {
        self.fsm.set_writing(id, cancel).await?;
        let result = self.download_inner(id, flags).await;
        self.fsm.set_idle(id).await;
        result
    }

    async fn download_inner(&self, id: ChunkId, flags: DownloadFlags) -> Result<()> {
        let path = chunk_path(&self.root, id);

        if !flags.contains(DownloadFlags::REMOTE_SYNC) && path.exists() {
            return Ok(());
        }

        let zipped = self.blobs.get(&self.blob_key(id)).await?;
        let bytes = unzip_single_entry(&id.to_string(), &zipped)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension(format!("download-{}", std::process::id()));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;
        debug!(chunk = %id, bytes = bytes.len(), "downloaded chunk");
        Ok(())
    }

    /// Rejects `RemoteDelete | RemoteSync` together. Uploads first if
    /// `RemoteSync` is set, removes the local file (ignoring `NotExist`),
    /// then deletes the remote key if `RemoteDelete` is set.
    pub async fn delete(&self, id: ChunkId, flags: DeleteFlags, cancel: &CancellationToken) -> Result<()> {
        if flags.contains(DeleteFlags::REMOTE_DELETE) && flags.contains(DeleteFlags::REMOTE_SYNC) {
            return Err(Error::invalid(
                "delete cannot combine RemoteDelete and RemoteSync",
            ));
        }

        if !self.fsm.set_deleting(id).await {
            return Err(Error::invalid(format!(
                "chunk {id} has an active reader or writer"
            )));
        }

        let result = self.delete_inner(id, flags).await;
        let _ = cancel;
        self.fsm.set_idle(id).await;
        result
    }

    async fn delete_inner(&self, id: ChunkId, flags: DeleteFlags) -> Result<()> {
        if flags.contains(DeleteFlags::REMOTE_SYNC) {
            self.upload_inner(id).await?;
        }

        let path = chunk_path(&self.root, id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if flags.contains(DeleteFlags::REMOTE_DELETE) {
            self.blobs.delete(&self.blob_key(id)).await?;
        }

        debug!(chunk = %id, "deleted chunk");
        Ok(())
    }
}

fn zip_single_entry(name: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();

    {
        let mut writer = ZipWriter::new(std::io::Cursor::new(&mut buf));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        writer
            .start_file(name, options)
            .map_err(|e| Error::internal(e.to_string()))?;
        writer.write_all(bytes)?;
        writer.finish().map_err(|e| Error::internal(e.to_string()))?;
    }

    Ok(buf)
}

fn unzip_single_entry(name: &str, zipped: &Bytes) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(std::io::Cursor::new(zipped.as_ref()))
        .map_err(|e| Error::corrupted(e.to_string()))?;
    let mut file = archive
        .by_name(name)
        .map_err(|_| Error::corrupted(format!("zip archive missing entry {name}")))?;
    let mut out = Vec::new();
    file.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::InMemoryBlobStore;
    use temp_testdir::TempDir;

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_remove_download_restores_bytes() {
        let dir = TempDir::default();
        let id = ChunkId::new();
        let path = chunk_path(dir.as_ref(), id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"chunk bytes").unwrap();

        let fsm = Arc::new(ChunkAccessorFsm::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::default());
        let replicator = Replicator::new(dir.to_path_buf(), fsm, blobs);
        let cancel = CancellationToken::new();

        replicator.upload(id, &cancel).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        replicator
            .download(id, DownloadFlags::empty(), &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"chunk bytes");

        // downloading again without RemoteSync is a no-op (file unchanged).
        std::fs::write(&path, b"locally modified").unwrap();
        replicator
            .download(id, DownloadFlags::empty(), &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"locally modified");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_rejects_conflicting_flags() {
        let dir = TempDir::default();
        let id = ChunkId::new();
        let fsm = Arc::new(ChunkAccessorFsm::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::default());
        let replicator = Replicator::new(dir.to_path_buf(), fsm, blobs);
        let cancel = CancellationToken::new();

        let err = replicator
            .delete(id, DeleteFlags::REMOTE_DELETE | DeleteFlags::REMOTE_SYNC, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_with_remote_sync_uploads_then_removes_local() {
        let dir = TempDir::default();
        let id = ChunkId::new();
        let path = chunk_path(dir.as_ref(), id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"chunk bytes").unwrap();

        let fsm = Arc::new(ChunkAccessorFsm::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::default());
        let replicator = Replicator::new(dir.to_path_buf(), fsm, blobs.clone());
        let cancel = CancellationToken::new();

        replicator
            .delete(id, DeleteFlags::REMOTE_SYNC, &cancel)
            .await
            .unwrap();

        assert!(!path.exists());
        assert!(blobs.exists(&format!("/{}/{}", id.shard(), id)).await.unwrap());
    }
}
