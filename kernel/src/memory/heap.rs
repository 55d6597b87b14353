//! The Kernel Heap
//!
//! First-fit allocator over a fixed virtual range. Every block starts with a
//! 16-byte header that lives in the heap itself:
//!
//! ```text
//! +0  size of the data region | FREE_BIT
//! +8  virtual address of the next header, 0 for the last block
//! +16 data
//! ```
//!
//! Blocks tile the range in address order with no gaps, and no two
//! neighbouring blocks are free once `free` returns.

use alloc::vec::Vec;
use log::{debug, error, info, trace, warn};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, Page, PageTableFlags, Size4KiB},
    VirtAddr,
};

use crate::constants::memory::{HEAP_ALIGN, HEAP_SIZE, HEAP_START, PAGE_SIZE};

use super::{paging::VirtualMemoryManager, MemoryError};

/// Bytes taken by a block header.
pub const HEADER_SIZE: usize = 16;

// sizes are multiples of HEAP_ALIGN, so bit 0 is free for the flag
const FREE_BIT: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No free block is large enough.
    Exhausted,
    /// Pointer is not the data pointer of any block.
    InvalidPointer(VirtAddr),
    DoubleFree(VirtAddr),
    /// Not even one block fits in the pages that could be mapped.
    NoBacking,
    Memory(MemoryError),
}

impl From<MemoryError> for HeapError {
    fn from(err: MemoryError) -> Self {
        HeapError::Memory(err)
    }
}

impl core::fmt::Display for HeapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HeapError::Exhausted => write!(f, "Heap exhausted"),
            HeapError::InvalidPointer(ptr) => {
                write!(f, "{:#x} is not a heap allocation", ptr.as_u64())
            }
            HeapError::DoubleFree(ptr) => write!(f, "{:#x} is already free", ptr.as_u64()),
            HeapError::NoBacking => write!(f, "No memory could be mapped for the heap"),
            HeapError::Memory(err) => write!(f, "{}", err),
        }
    }
}

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub addr: VirtAddr,
    pub size: usize,
    pub free: bool,
    pub next: Option<VirtAddr>,
}

impl Block {
    fn data(&self) -> VirtAddr {
        self.addr + HEADER_SIZE as u64
    }

    fn end(&self) -> VirtAddr {
        self.data() + self.size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub blocks: usize,
    pub free_blocks: usize,
}

pub struct Heap {
    start: VirtAddr,
    size: usize,
}

impl Heap {
    /// Backs the fixed kernel heap range and sets it up as one free block.
    pub fn init<A>(vmm: &mut VirtualMemoryManager, frame_allocator: &mut A) -> Result<Self, HeapError>
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        Self::init_range(VirtAddr::new(HEAP_START), HEAP_SIZE, vmm, frame_allocator)
    }

    /// Same as [`init`](Self::init) for an arbitrary page-aligned range.
    ///
    /// `size` is rounded down to a multiple of 16. If frames run out part
    /// way, the heap shrinks to the pages that did get mapped.
    pub fn init_range<A>(
        start: VirtAddr,
        size: usize,
        vmm: &mut VirtualMemoryManager,
        frame_allocator: &mut A,
    ) -> Result<Self, HeapError>
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        // block sizes must keep bit 0 clear for FREE_BIT
        let size = size - size % HEAP_ALIGN;
        if size < HEADER_SIZE + HEAP_ALIGN {
            error!("Heap range of {} bytes cannot hold a block", size);
            return Err(HeapError::NoBacking);
        }

        let page_range = {
            let heap_start_page: Page = Page::containing_address(start);
            let heap_end_page = Page::containing_address(start + (size as u64 - 1));
            Page::range_inclusive(heap_start_page, heap_end_page)
        };

        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        let mut backed = 0;
        for page in page_range {
            if let Err(err) = vmm.create_mapping(page, flags, frame_allocator) {
                error!("Failed to allocate heap pages: {}", err);
                break;
            }
            backed += PAGE_SIZE as usize;
        }
        let requested = size;
        let size = backed.min(requested);

        if size < HEADER_SIZE + HEAP_ALIGN {
            return Err(HeapError::NoBacking);
        }
        if size < requested {
            warn!(
                "Heap only partially backed: {:#X} of {:#X} bytes",
                size, requested
            );
        }

        let heap = Self { start, size };
        heap.write_block(
            vmm,
            &Block {
                addr: start,
                size: size - HEADER_SIZE,
                free: true,
                next: None,
            },
        )?;

        info!("Heap ready at {:#X}, {} bytes", start.as_u64(), size);
        Ok(heap)
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Bytes of the heap range that are backed and usable.
    pub fn size(&self) -> usize {
        self.size
    }

    /// First-fit allocation of `size` bytes, rounded up to 16.
    pub fn allocate(
        &mut self,
        vmm: &mut VirtualMemoryManager,
        size: usize,
    ) -> Result<VirtAddr, HeapError> {
        if size > self.size {
            warn!("Heap allocation of {} bytes can never fit", size);
            return Err(HeapError::Exhausted);
        }
        let size = size.max(1).next_multiple_of(HEAP_ALIGN);

        let mut cursor = Some(self.start);
        while let Some(addr) = cursor {
            let mut block = self.read_block(vmm, addr)?;

            if block.free && block.size >= size + HEADER_SIZE {
                if block.size > size + HEADER_SIZE + HEAP_ALIGN {
                    let rest = Block {
                        addr: block.data() + size as u64,
                        size: block.size - size - HEADER_SIZE,
                        free: true,
                        next: block.next,
                    };
                    self.write_block(vmm, &rest)?;
                    block.size = size;
                    block.next = Some(rest.addr);
                }
                block.free = false;
                self.write_block(vmm, &block)?;

                trace!("heap: {} bytes at {:#X}", block.size, block.data().as_u64());
                return Ok(block.data());
            }

            cursor = block.next;
        }

        warn!("Heap exhausted allocating {} bytes", size);
        Err(HeapError::Exhausted)
    }

    /// Releases an allocation and merges it with free neighbours. A null
    /// pointer is ignored.
    pub fn free(&mut self, vmm: &mut VirtualMemoryManager, ptr: VirtAddr) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        if ptr < self.start + HEADER_SIZE as u64 || ptr >= self.start + self.size as u64 {
            error!("Freeing {:#X}, outside the heap", ptr.as_u64());
            return Err(HeapError::InvalidPointer(ptr));
        }

        // no back links, so the predecessor comes from walking the list
        let target = ptr - HEADER_SIZE as u64;
        let mut prev: Option<Block> = None;
        let mut cursor = Some(self.start);
        let mut block = loop {
            let Some(addr) = cursor else {
                return Err(HeapError::InvalidPointer(ptr));
            };
            let block = self.read_block(vmm, addr)?;
            if block.addr == target {
                break block;
            }
            if block.addr < target && target < block.end() {
                return Err(if block.free {
                    error!("Double free of {:#X}", ptr.as_u64());
                    HeapError::DoubleFree(ptr)
                } else {
                    error!("Freeing {:#X}, inside another allocation", ptr.as_u64());
                    HeapError::InvalidPointer(ptr)
                });
            }
            prev = Some(block);
            cursor = block.next;
        };

        if block.free {
            error!("Double free of {:#X}", ptr.as_u64());
            return Err(HeapError::DoubleFree(ptr));
        }
        block.free = true;

        if let Some(next_addr) = block.next {
            let next = self.read_block(vmm, next_addr)?;
            if next.free {
                block.size += HEADER_SIZE + next.size;
                block.next = next.next;
            }
        }

        match prev {
            Some(mut prev) if prev.free => {
                prev.size += HEADER_SIZE + block.size;
                prev.next = block.next;
                self.write_block(vmm, &prev)?;
            }
            _ => self.write_block(vmm, &block)?,
        }

        trace!("heap: freed {:#X}", ptr.as_u64());
        Ok(())
    }

    /// Snapshot of the block list in address order.
    pub fn blocks(&self, vmm: &VirtualMemoryManager) -> Result<Vec<Block>, HeapError> {
        let mut blocks = Vec::new();
        let mut cursor = Some(self.start);
        while let Some(addr) = cursor {
            let block = self.read_block(vmm, addr)?;
            cursor = block.next;
            blocks.push(block);
        }
        Ok(blocks)
    }

    pub fn stats(&self, vmm: &VirtualMemoryManager) -> Result<HeapStats, HeapError> {
        let stats = self
            .blocks(vmm)?
            .iter()
            .fold(HeapStats { total: self.size, ..Default::default() }, |mut stats, block| {
                stats.blocks += 1;
                if block.free {
                    stats.free += block.size;
                    stats.free_blocks += 1;
                } else {
                    stats.used += block.size;
                }
                stats
            });
        debug!("{:?}", stats);
        Ok(stats)
    }

    fn read_block(&self, vmm: &VirtualMemoryManager, addr: VirtAddr) -> Result<Block, MemoryError> {
        let word = vmm.read_u64(addr)?;
        let next = vmm.read_u64(addr + 8u64)?;
        Ok(Block {
            addr,
            size: (word & !FREE_BIT) as usize,
            free: word & FREE_BIT != 0,
            next: (next != 0).then(|| VirtAddr::new(next)),
        })
    }

    fn write_block(&self, vmm: &mut VirtualMemoryManager, block: &Block) -> Result<(), MemoryError> {
        let flag = if block.free { FREE_BIT } else { 0 };
        vmm.write_u64(block.addr, block.size as u64 | flag)?;
        vmm.write_u64(
            block.addr + 8u64,
            block.next.map_or(0, |next| next.as_u64()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        bitmap_frame_allocator::BitmapFrameAllocator, physical_memory::PhysicalMemory,
    };
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    const MEMORY: u64 = 16 * 1024 * 1024;

    fn setup(heap_size: usize) -> (Heap, VirtualMemoryManager, BitmapFrameAllocator) {
        let mut frames = BitmapFrameAllocator::init(MEMORY);
        let mut vmm = VirtualMemoryManager::new(PhysicalMemory::new(MEMORY), &mut frames).unwrap();
        let heap =
            Heap::init_range(VirtAddr::new(HEAP_START), heap_size, &mut vmm, &mut frames).unwrap();
        (heap, vmm, frames)
    }

    /// Checks contiguity and that no two neighbours are both free.
    fn assert_well_formed(heap: &Heap, vmm: &VirtualMemoryManager) {
        let blocks = heap.blocks(vmm).unwrap();
        assert_eq!(blocks[0].addr, heap.start());
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].end(), pair[1].addr);
            assert!(!(pair[0].free && pair[1].free), "unmerged free blocks {:?}", pair);
        }
        assert_eq!(
            blocks.last().unwrap().end(),
            heap.start() + heap.size() as u64
        );
    }

    #[test]
    fn test_init_single_free_block() {
        let (heap, vmm, _) = setup(HEAP_SIZE);
        let blocks = heap.blocks(&vmm).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, HEAP_SIZE - HEADER_SIZE);
        assert!(blocks[0].free);
    }

    #[test]
    fn test_freed_block_is_reused_for_smaller_request() {
        let (mut heap, mut vmm, _) = setup(HEAP_SIZE);
        let first = heap.allocate(&mut vmm, 32).unwrap();
        let second = heap.allocate(&mut vmm, 64).unwrap();
        assert_eq!(second, first + 48u64);

        heap.free(&mut vmm, first).unwrap();
        let third = heap.allocate(&mut vmm, 16).unwrap();
        assert_eq!(third, first);
        assert_well_formed(&heap, &vmm);
    }

    #[test]
    fn test_allocate_free_allocate_reuses_address() {
        let (mut heap, mut vmm, _) = setup(64 * 1024);
        for size in [1, 16, 100, 4096, 60000] {
            let ptr = heap.allocate(&mut vmm, size).unwrap();
            heap.free(&mut vmm, ptr).unwrap();
            assert_eq!(heap.allocate(&mut vmm, size), Ok(ptr));
            heap.free(&mut vmm, ptr).unwrap();
            assert_eq!(heap.blocks(&vmm).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_pointers_are_aligned() {
        let (mut heap, mut vmm, _) = setup(64 * 1024);
        for size in [1, 7, 17, 33, 250] {
            let ptr = heap.allocate(&mut vmm, size).unwrap();
            assert_eq!(ptr.as_u64() % HEAP_ALIGN as u64, 0);
        }
    }

    #[test]
    fn test_adjacent_frees_coalesce() {
        let (mut heap, mut vmm, _) = setup(64 * 1024);
        let a = heap.allocate(&mut vmm, 32).unwrap();
        let b = heap.allocate(&mut vmm, 64).unwrap();
        let _c = heap.allocate(&mut vmm, 16).unwrap();

        heap.free(&mut vmm, a).unwrap();
        heap.free(&mut vmm, b).unwrap();

        let blocks = heap.blocks(&vmm).unwrap();
        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].free);
        assert_eq!(blocks[0].size, 32 + HEADER_SIZE + 64);

        // neither pointer can be freed again, and nothing merges twice
        assert_eq!(heap.free(&mut vmm, b), Err(HeapError::DoubleFree(b)));
        assert_eq!(heap.free(&mut vmm, a), Err(HeapError::DoubleFree(a)));
        assert_eq!(heap.blocks(&vmm).unwrap(), blocks);
    }

    #[test]
    fn test_free_merges_both_sides() {
        let (mut heap, mut vmm, _) = setup(64 * 1024);
        let a = heap.allocate(&mut vmm, 32).unwrap();
        let b = heap.allocate(&mut vmm, 32).unwrap();
        let c = heap.allocate(&mut vmm, 32).unwrap();
        let _d = heap.allocate(&mut vmm, 32).unwrap();

        heap.free(&mut vmm, a).unwrap();
        heap.free(&mut vmm, c).unwrap();
        heap.free(&mut vmm, b).unwrap();

        let blocks = heap.blocks(&vmm).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].size, 3 * 32 + 2 * HEADER_SIZE);
        assert_well_formed(&heap, &vmm);
    }

    #[test]
    fn test_split_threshold() {
        let (mut heap, mut vmm, _) = setup(4096);
        let capacity = 4096 - HEADER_SIZE;

        // the remainder would be exactly a header plus 16 bytes: no split
        let whole = heap
            .allocate(&mut vmm, capacity - HEADER_SIZE - HEAP_ALIGN)
            .unwrap();
        let blocks = heap.blocks(&vmm).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, capacity);
        heap.free(&mut vmm, whole).unwrap();

        heap.allocate(&mut vmm, capacity - HEADER_SIZE - 2 * HEAP_ALIGN)
            .unwrap();
        let blocks = heap.blocks(&vmm).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].size, 2 * HEAP_ALIGN);
    }

    #[test]
    fn test_exhaustion() {
        let (mut heap, mut vmm, _) = setup(4096);
        let capacity = 4096 - HEADER_SIZE;

        // a block must have room for the request plus a header
        assert_eq!(heap.allocate(&mut vmm, capacity), Err(HeapError::Exhausted));
        assert_eq!(heap.allocate(&mut vmm, usize::MAX), Err(HeapError::Exhausted));
        heap.allocate(&mut vmm, capacity - HEADER_SIZE).unwrap();
        assert_eq!(heap.allocate(&mut vmm, 16), Err(HeapError::Exhausted));
    }

    #[test]
    fn test_invalid_frees() {
        let (mut heap, mut vmm, _) = setup(4096);
        let ptr = heap.allocate(&mut vmm, 64).unwrap();

        assert_eq!(heap.free(&mut vmm, VirtAddr::zero()), Ok(()));
        assert_eq!(
            heap.free(&mut vmm, ptr + 16u64),
            Err(HeapError::InvalidPointer(ptr + 16u64))
        );
        let outside = VirtAddr::new(0x1000);
        assert_eq!(heap.free(&mut vmm, outside), Err(HeapError::InvalidPointer(outside)));
        assert_eq!(heap.free(&mut vmm, ptr), Ok(()));
    }

    #[test]
    fn test_partial_backing_shrinks_heap() {
        // 256 frames past the reserved megabyte
        let mut frames = BitmapFrameAllocator::init(2 * 1024 * 1024);
        let mut vmm =
            VirtualMemoryManager::new(PhysicalMemory::new(2 * 1024 * 1024), &mut frames).unwrap();

        let heap = Heap::init(&mut vmm, &mut frames).unwrap();
        // root, three tables, one frame per page
        assert_eq!(heap.size(), 252 * 4096);
        assert_eq!(frames.free_frames(), 0);
        assert_well_formed(&heap, &vmm);
    }

    #[test]
    fn test_too_small_range() {
        let mut frames = BitmapFrameAllocator::init(MEMORY);
        let mut vmm = VirtualMemoryManager::new(PhysicalMemory::new(MEMORY), &mut frames).unwrap();
        let free_before = frames.free_frames();

        for size in [0, 1, HEADER_SIZE, HEADER_SIZE + HEAP_ALIGN - 1] {
            assert_eq!(
                Heap::init_range(VirtAddr::new(HEAP_START), size, &mut vmm, &mut frames).err(),
                Some(HeapError::NoBacking)
            );
        }
        assert_eq!(frames.free_frames(), free_before);
    }

    #[test]
    fn test_unaligned_size_rounds_down() {
        let (mut heap, mut vmm, _) = setup(4097);
        assert_eq!(heap.size(), 4096);
        assert_well_formed(&heap, &vmm);

        let ptr = heap.allocate(&mut vmm, 100).unwrap();
        assert_well_formed(&heap, &vmm);
        heap.free(&mut vmm, ptr).unwrap();
        let blocks = heap.blocks(&vmm).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 4096 - HEADER_SIZE);
        assert!(blocks[0].free);
    }

    #[test]
    fn test_no_backing() {
        let mut frames = BitmapFrameAllocator::init(257 * 4096);
        let mut vmm =
            VirtualMemoryManager::new(PhysicalMemory::new(257 * 4096), &mut frames).unwrap();
        assert_eq!(
            Heap::init(&mut vmm, &mut frames).err(),
            Some(HeapError::NoBacking)
        );
    }

    #[test]
    fn test_random_workload_keeps_list_well_formed() {
        let mut rng = SmallRng::seed_from_u64(42);
        let (mut heap, mut vmm, _) = setup(64 * 1024);
        let mut live: Vec<(VirtAddr, usize, u8)> = Vec::new();

        for round in 0..2000u32 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..600);
                if let Ok(ptr) = heap.allocate(&mut vmm, size) {
                    let fill = round as u8;
                    vmm.write(ptr, &alloc::vec![fill; size]).unwrap();
                    live.push((ptr, size, fill));
                }
            } else {
                let (ptr, size, fill) = live.swap_remove(rng.gen_range(0..live.len()));
                let mut back = alloc::vec![0u8; size];
                vmm.read(ptr, &mut back).unwrap();
                assert!(back.iter().all(|&b| b == fill), "allocation at {:?} clobbered", ptr);
                heap.free(&mut vmm, ptr).unwrap();
                assert_well_formed(&heap, &vmm);
            }
        }

        for (ptr, _, _) in live.drain(..) {
            heap.free(&mut vmm, ptr).unwrap();
        }
        let stats = heap.stats(&vmm).unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free, 64 * 1024 - HEADER_SIZE);
    }
}
