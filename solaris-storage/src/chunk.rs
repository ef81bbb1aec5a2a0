//! Chunk file.
//!
//! Layout: `[header: 32 B][payloads grow →][… free space …][← reverse meta
//! index]`. Meta entry `i` (the `i`-th record appended, also its ascending
//! position by id) lives at absolute offset `file_size − (i+1)·24`, so the
//! header and payloads can grow forward while the index grows backward
//! without moving either on open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use parking_lot::{ArcRwLockReadGuard, RawRwLock, RwLock};

use solaris_common::error::{Error, Result};
use solaris_common::iterator::IteratorIO;
use solaris_common::ulid::{MonotonicGenerator, Ulid};

use crate::constants::{aligned_to_page, CHUNK_HEADER_SIZE, CHUNK_MAGIC, META_ENTRY_SIZE};
use crate::mmap::MemoryMappedFile;

#[derive(Debug, Clone, Copy)]
pub struct ChunkSizing {
    pub new_size: usize,
    pub max_chunk_size: usize,
    pub max_grow_increase_size: usize,
}

impl Default for ChunkSizing {
    fn default() -> Self {
        Self {
            new_size: crate::constants::DEFAULT_NEW_SIZE,
            max_chunk_size: crate::constants::DEFAULT_MAX_CHUNK_SIZE,
            max_grow_increase_size: crate::constants::DEFAULT_MAX_GROW_INCREASE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MetaEntry {
    id: Ulid,
    payload_offset: u32,
    payload_size: u32,
}

fn meta_offset(file_size: i64, index: u32) -> i64 {
    file_size - (index as i64 + 1) * META_ENTRY_SIZE as i64
}

fn read_meta(buf: &[u8]) -> MetaEntry {
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&buf[0..16]);

    MetaEntry {
        id: Ulid::from_bytes(id_bytes),
        payload_offset: BigEndian::read_u32(&buf[16..20]),
        payload_size: BigEndian::read_u32(&buf[20..24]),
    }
}

fn write_meta(buf: &mut [u8], entry: MetaEntry) {
    buf[0..16].copy_from_slice(&entry.id.to_bytes());
    BigEndian::write_u32(&mut buf[16..20], entry.payload_offset);
    BigEndian::write_u32(&mut buf[20..24], entry.payload_size);
}

struct Inner {
    mmf: MemoryMappedFile,
    sizing: ChunkSizing,
    record_count: u32,
    /// Offset of the next free payload byte.
    free_cursor: i64,
    closed: bool,
}

impl Inner {
    fn meta_region_start(&self) -> i64 {
        self.mmf.size() - self.record_count as i64 * META_ENTRY_SIZE as i64
    }

    fn last_id(&self) -> Result<Option<Ulid>> {
        if self.record_count == 0 {
            return Ok(None);
        }

        let off = meta_offset(self.mmf.size(), self.record_count - 1);
        let entry = read_meta(self.mmf.buffer(off, META_ENTRY_SIZE)?);
        Ok(Some(entry.id))
    }

    fn meta_at(&self, index: u32) -> Result<MetaEntry> {
        let off = meta_offset(self.mmf.size(), index);
        Ok(read_meta(self.mmf.buffer(off, META_ENTRY_SIZE)?))
    }
}

/// Binary record store with a reverse meta index; append + iterator.
pub struct ChunkFile {
    path: PathBuf,
    inner: Arc<RwLock<Inner>>,
}

pub struct AppendOutcome {
    pub written: usize,
    pub start_id: Ulid,
    pub last_id: Ulid,
}

impl ChunkFile {
    /// Opens (creating if absent) the chunk file at `path`. If `full_check`
    /// is set, every meta entry is validated on open (ids strictly
    /// increasing, offsets contiguous, sizes within bounds); any violation
    /// fails [`Error::Corrupted`].
    pub fn open(path: impl AsRef<Path>, sizing: ChunkSizing, full_check: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let initial_size = if existed {
            -1
        } else {
            aligned_to_page(sizing.new_size.max(CHUNK_HEADER_SIZE)) as i64
        };

        let mut mmf = MemoryMappedFile::open(&path, initial_size)?;

        if mmf.size() < CHUNK_HEADER_SIZE as i64 {
            mmf.grow(aligned_to_page(sizing.new_size.max(CHUNK_HEADER_SIZE)) as i64)?;
        }

        let is_fresh = mmf.buffer(0, 8)? != CHUNK_MAGIC;

        if is_fresh {
            let header = mmf.buffer_mut(0, CHUNK_HEADER_SIZE)?;
            header[..8].copy_from_slice(&CHUNK_MAGIC);
            BigEndian::write_u32(&mut header[8..12], 0);
            header[12..32].fill(0);
            mmf.flush()?;
        }

        let count = BigEndian::read_u32(mmf.buffer(8, 4)?);
        let file_size = mmf.size();
        let meta_region_start = file_size - count as i64 * META_ENTRY_SIZE as i64;

        let free_cursor = if count > 0 {
            let off = meta_offset(file_size, count - 1);
            let entry = read_meta(mmf.buffer(off, META_ENTRY_SIZE)?);
            entry.payload_offset as i64 + entry.payload_size as i64
        } else {
            CHUNK_HEADER_SIZE as i64
        };

        if free_cursor < CHUNK_HEADER_SIZE as i64 || free_cursor > meta_region_start {
            return Err(Error::corrupted(format!(
                "chunk {}: free cursor {free_cursor} outside [{}, {meta_region_start}]",
                path.display(),
                CHUNK_HEADER_SIZE
            )));
        }

        if full_check && count > 0 {
            let mut prev_id: Option<Ulid> = None;
            let mut expected_offset = CHUNK_HEADER_SIZE as i64;

            for i in 0..count {
                let off = meta_offset(file_size, i);
                let entry = read_meta(mmf.buffer(off, META_ENTRY_SIZE)?);

                if let Some(prev) = prev_id {
                    if entry.id <= prev {
                        return Err(Error::corrupted(format!(
                            "chunk {}: ids not strictly increasing at entry {i}",
                            path.display()
                        )));
                    }
                }

                if entry.payload_offset as i64 != expected_offset {
                    return Err(Error::corrupted(format!(
                        "chunk {}: payload gap at entry {i} (expected {expected_offset}, got {})",
                        path.display(),
                        entry.payload_offset
                    )));
                }

                if entry.payload_offset as i64 + entry.payload_size as i64 > meta_region_start {
                    return Err(Error::corrupted(format!(
                        "chunk {}: payload of entry {i} overruns the meta region",
                        path.display()
                    )));
                }

                expected_offset += entry.payload_size as i64;
                prev_id = Some(entry.id);
            }
        }

        Ok(Self {
            path,
            inner: Arc::new(RwLock::new(Inner {
                mmf,
                sizing,
                record_count: count,
                free_cursor,
                closed: false,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> u32 {
        self.inner.read().record_count
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.read();
        inner.meta_region_start() - inner.free_cursor < META_ENTRY_SIZE as i64
            && inner.mmf.size() >= inner.sizing.max_chunk_size as i64
    }

    /// Appends the largest prefix of `payloads` that fits under the
    /// chunk's `MaxChunkSize` and the caller-supplied `max_bunch_bytes`
    /// budget (steps 1-7). Fails [`Error::Invalid`] if the
    /// chunk is empty and the very first payload alone does not fit;
    /// fails [`Error::Exhausted`] if the chunk already holds data and has
    /// no room left for even one more record (the caller must roll over
    /// to a fresh chunk).
    pub fn append_records(
        &self,
        payloads: &[Bytes],
        max_bunch_bytes: usize,
        generator: &mut MonotonicGenerator,
        floor: Option<Ulid>,
    ) -> Result<AppendOutcome> {
        if payloads.is_empty() {
            return Err(Error::invalid("append_records called with no payloads"));
        }

        let mut inner = self.inner.write();

        if inner.closed {
            return Err(Error::Closed);
        }

        let hard_max = inner.sizing.max_chunk_size as i64;
        let effective_floor = match (inner.last_id()?, floor) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => Ulid::MIN,
        };

        // Step 1: find k, the largest prefix that fits.
        let used_after_growth_ceiling = hard_max - inner.free_cursor - inner.record_count as i64 * META_ENTRY_SIZE as i64;
        let mut k = 0usize;
        let mut payload_bytes = 0i64;

        for payload in payloads {
            let candidate_payload = payload_bytes + payload.len() as i64;
            let candidate_meta = (k as i64 + 1) * META_ENTRY_SIZE as i64;

            if candidate_payload + candidate_meta > used_after_growth_ceiling {
                break;
            }

            if max_bunch_bytes > 0 && candidate_payload > max_bunch_bytes as i64 {
                break;
            }

            payload_bytes = candidate_payload;
            k += 1;
        }

        if k == 0 {
            if inner.record_count == 0 {
                return Err(Error::invalid(
                    "a single record exceeds the chunk's maximum size",
                ));
            }

            return Err(Error::Exhausted("chunk has no room for another record".into()));
        }

        let needed_bytes = payload_bytes + k as i64 * META_ENTRY_SIZE as i64;
        let currently_free = inner.meta_region_start() - inner.free_cursor;

        if needed_bytes > currently_free {
            grow_for(&mut inner, needed_bytes)?;
        }

        // Step 3-5: generate ids, write meta + payload.
        let mut cursor = inner.free_cursor;
        let mut current_floor = Some(effective_floor);
        let mut start_id = None;
        let mut last_id = Ulid::MIN;

        for (i, payload) in payloads.iter().take(k).enumerate() {
            let id = generator.next_after(current_floor);
            current_floor = None;

            if start_id.is_none() {
                start_id = Some(id);
            }
            last_id = id;

            let meta_index = inner.record_count + i as u32;
            let offset = meta_offset(inner.mmf.size(), meta_index);

            {
                let meta_buf = inner.mmf.buffer_mut(offset, META_ENTRY_SIZE)?;
                write_meta(
                    meta_buf,
                    MetaEntry {
                        id,
                        payload_offset: cursor as u32,
                        payload_size: payload.len() as u32,
                    },
                );
            }

            {
                let payload_buf = inner.mmf.buffer_mut(cursor, payload.len())?;
                payload_buf.copy_from_slice(payload);
            }

            cursor += payload.len() as i64;
        }

        inner.record_count += k as u32;
        inner.free_cursor = cursor;

        {
            let header = inner.mmf.buffer_mut(8, 4)?;
            BigEndian::write_u32(header, inner.record_count);
        }

        inner.mmf.flush()?;

        Ok(AppendOutcome {
            written: k,
            start_id: start_id.unwrap(),
            last_id,
        })
    }

    /// Shared-lock reader over the current snapshot of meta entries,
    /// ascending or descending. Held until the reader is closed/dropped.
    pub fn open_reader(&self, descending: bool) -> Result<ChunkReader> {
        let guard = self.inner.read_arc();

        if guard.closed {
            return Err(Error::Closed);
        }

        let count = guard.record_count;
        let cursor = if descending {
            count as i64 - 1
        } else {
            0
        };

        Ok(ChunkReader {
            guard,
            descending,
            cursor,
        })
    }

    pub fn close(self) {
        self.inner.write().closed = true;
    }
}

/// Relocates the reverse meta index to hug the new end-of-file, then
/// grows the mapping. Called with `needed_bytes` representing the total
/// space (payload + new meta entries) the pending append needs.
fn grow_for(inner: &mut Inner, needed_bytes: i64) -> Result<()> {
    let old_size = inner.mmf.size();
    let meta_bytes = inner.record_count as i64 * META_ENTRY_SIZE as i64;

    let saved_meta = if meta_bytes > 0 {
        let start = inner.meta_region_start();
        Some(inner.mmf.buffer(start, meta_bytes as usize)?.to_vec())
    } else {
        None
    };

    // new length = min(MaxChunkSize, current +
    // min(MaxGrowIncreaseSize, current)), and at least enough to fit the
    // needed bytes, rounded up to the system page size.
    let geometric = old_size + (inner.sizing.max_grow_increase_size as i64).min(old_size);
    let minimum_required = inner.free_cursor + needed_bytes + meta_bytes;
    let mut new_size = geometric.max(minimum_required);
    new_size = new_size.min(inner.sizing.max_chunk_size as i64);
    new_size = (aligned_to_page(new_size as usize) as i64).min(inner.sizing.max_chunk_size as i64);

    inner.mmf.grow(new_size)?;

    if let Some(meta) = saved_meta {
        let new_meta_start = new_size - meta_bytes;
        let buf = inner.mmf.buffer_mut(new_meta_start, meta.len())?;
        buf.copy_from_slice(&meta);
    }

    Ok(())
}

/// Ascending or descending iterator over `(id, payload)` pairs, holding a
/// shared lock on the chunk for its lifetime. The payload view is only
/// guaranteed valid while the reader is alive; callers that need it
/// afterwards must copy it out (which `next` already does by returning an
/// owned [`Bytes`]).
pub struct ChunkReader {
    guard: ArcRwLockReadGuard<RawRwLock, Inner>,
    descending: bool,
    cursor: i64,
}

impl ChunkReader {
    /// Repositions to the first meta entry ≥ `id` (ascending) or the last
    /// ≤ `id` (descending) via binary search on the sorted meta region.
    pub fn set_start_id(&mut self, id: Ulid) -> Result<()> {
        let count = self.guard.record_count;

        if count == 0 {
            self.cursor = if self.descending { -1 } else { 0 };
            return Ok(());
        }

        // lower_bound: first index whose id >= target
        let mut lo = 0u32;
        let mut hi = count;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.guard.meta_at(mid)?;

            if entry.id < id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        self.cursor = if self.descending {
            lo as i64 - 1
        } else {
            lo as i64
        };

        Ok(())
    }

    fn read_at(&self, index: u32) -> Result<(Ulid, Bytes)> {
        let entry = self.guard.meta_at(index)?;
        let payload = self
            .guard
            .mmf
            .buffer(entry.payload_offset as i64, entry.payload_size as usize)?;
        Ok((entry.id, Bytes::copy_from_slice(payload)))
    }

    pub fn close(self) {
        drop(self);
    }
}

impl IteratorIO for ChunkReader {
    type Item = (Ulid, Bytes);

    fn next(&mut self) -> Result<Option<Self::Item>> {
        let count = self.guard.record_count as i64;

        if self.cursor < 0 || self.cursor >= count {
            return Ok(None);
        }

        let item = self.read_at(self.cursor as u32)?;
        self.cursor += if self.descending { -1 } else { 1 };

        Ok(Some(item))
    }
}
