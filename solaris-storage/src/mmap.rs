//! Memory-mapped file. Owns a file handle plus a
//! mapping covering the file's current length; random byte-range access,
//! no locking of its own — concurrency is the chunk file's
//! responsibility.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use solaris_common::error::{Error, Result};

pub struct MemoryMappedFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    len: i64,
}

impl MemoryMappedFile {
    /// Creates the file if absent. `initial_size < 0` maps the file as-is
    /// (failing `Invalid` if the file does not exist); otherwise truncates
    /// to `initial_size` and maps.
    pub fn open(path: impl AsRef<Path>, initial_size: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();

        if !existed && initial_size < 0 {
            return Err(Error::invalid(format!(
                "cannot open non-existent file {} without an initial size",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let existing_len = file.metadata()?.len() as i64;

        let target_len = if initial_size < 0 || initial_size == existing_len {
            existing_len
        } else {
            initial_size
        };

        if target_len != existing_len {
            file.set_len(target_len as u64)?;
        }

        let mmap = if target_len == 0 {
            // memmap2 refuses to map a zero-length file; callers that need
            // an empty mapping (fresh chunk before the header write) go
            // through `grow` first.
            unsafe { MmapMut::map_mut(&file) }.unwrap_or_else(|_| {
                file.set_len(1).ok();
                unsafe { MmapMut::map_mut(&file) }.expect("map a 1-byte placeholder file")
            })
        } else {
            unsafe { MmapMut::map_mut(&file)? }
        };

        Ok(Self {
            path,
            file,
            mmap,
            len: target_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> i64 {
        self.len
    }

    /// Unmaps, truncates upward (must be strictly greater than the
    /// current size, on a system-page multiple) and remaps.
    pub fn grow(&mut self, new_size: i64) -> Result<()> {
        if new_size <= self.len {
            return Err(Error::invalid(format!(
                "grow requires new_size > current size ({new_size} <= {})",
                self.len
            )));
        }

        if new_size % page_size() as i64 != 0 {
            return Err(Error::invalid(format!(
                "grow target {new_size} is not a multiple of the system page size"
            )));
        }

        self.file.set_len(new_size as u64)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.len = new_size;

        Ok(())
    }

    /// Returns a view into the mapping, clamped on the right to file size.
    /// Valid until the next `grow` or `close`.
    pub fn buffer(&self, offset: i64, len: usize) -> Result<&[u8]> {
        let (start, end) = self.clamp_range(offset, len)?;
        Ok(&self.mmap[start..end])
    }

    /// Mutable counterpart of [`Self::buffer`]. Callers are responsible
    /// for serializing concurrent writers; the mapping
    /// itself enforces nothing.
    pub fn buffer_mut(&mut self, offset: i64, len: usize) -> Result<&mut [u8]> {
        let (start, end) = self.clamp_range(offset, len)?;
        Ok(&mut self.mmap[start..end])
    }

    fn clamp_range(&self, offset: i64, len: usize) -> Result<(usize, usize)> {
        if offset < 0 || offset > self.len {
            return Err(Error::invalid(format!(
                "offset {offset} out of range (file size {})",
                self.len
            )));
        }

        let start = offset as usize;
        let end = (start + len).min(self.len as usize);

        Ok((start, end))
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Idempotent unmap. Subsequent use of `buffer`/`buffer_mut` returns
    /// stale data from the dropped mapping's backing store only if the
    /// caller keeps a reference past `close`, which the type system here
    /// prevents by consuming `self`.
    pub fn close(self) {
        drop(self);
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a real system.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}
