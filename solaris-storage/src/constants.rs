//! Chunk sizing defaults, expressed in multiples of the conventional
//! 4 KiB page; all three are configurable (`Chunk.NewSize`,
//! `Chunk.MaxChunkSize`, `Chunk.MaxGrowIncreaseSize`) rather than baked in.

pub const PAGE_SIZE: usize = 4 * 1024;

pub const DEFAULT_NEW_SIZE: usize = 16 * PAGE_SIZE;
pub const DEFAULT_MAX_GROW_INCREASE_SIZE: usize = 256 * PAGE_SIZE;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 512 * 1024 * PAGE_SIZE;

/// `"SOLARIS\x01"`, the chunk file magic + version.
pub const CHUNK_MAGIC: [u8; 8] = *b"SOLARIS\x01";

/// Offset 0..8 magic, 8..12 record count, 12..32 reserved.
pub const CHUNK_HEADER_SIZE: usize = 32;

/// `id(16) | payload_offset(4) | payload_size(4)`.
pub const META_ENTRY_SIZE: usize = 24;

pub fn aligned_to_page(size: usize) -> usize {
    if size % PAGE_SIZE == 0 {
        size
    } else {
        (size / PAGE_SIZE + 1) * PAGE_SIZE
    }
}
