//! Fixed memory layout. None of these are discovered at runtime.

pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Higher-half offset at which the first gigabyte of physical memory is mirrored.
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

// Sits inside the higher-half mirror; heap pages overwrite those mappings.
pub const HEAP_START: u64 = 0xFFFF_FFFF_8040_0000;
pub const HEAP_SIZE: usize = 4 * 1024 * 1024; // 4 MB

/// Heap blocks are rounded to this many bytes, and so are block headers.
pub const HEAP_ALIGN: usize = 16;

/// First 1 MB of physical memory is never handed out.
pub const RESERVED_FRAMES: usize = 256;

/// Largest physical range the frame bitmap can describe (8 GB).
pub const MAX_PHYSICAL_MEMORY: u64 = 8 * 1024 * 1024 * 1024;
pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const BITMAP_WORDS: usize = (MAX_PHYSICAL_MEMORY as usize / FRAME_SIZE) / BITMAP_ENTRY_SIZE;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;

/// Physical memory assumed when the platform does not say otherwise.
pub const DEFAULT_TOTAL_MEMORY: u64 = 1024 * 1024 * 1024; // 1 GB
/// Size of the identity map and of its higher-half mirror.
pub const DEFAULT_IDENTITY_MAP_SIZE: u64 = 0x4000_0000; // 1 GB

/// Bits 12..51 of a page table entry.
pub const ENTRY_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
