use crate::constants::memory::{
    BITMAP_ENTRY_SIZE, BITMAP_WORDS, FRAME_SIZE, FULL_BITMAP_ENTRY, MAX_PHYSICAL_MEMORY,
    RESERVED_FRAMES,
};
use log::{debug, error, warn};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use alloc::{boxed::Box, vec};

use super::{FrameError, MemoryInfo};

/// Physical page allocator: one bit per frame, 1 = allocated.
///
/// Frames are always handed out lowest index first, so a fixed sequence of
/// calls produces a fixed physical layout.
pub struct BitmapFrameAllocator {
    total_frames: usize,
    free_frames: usize,
    reserved_frames: usize,
    bitmap: Box<[u64]>,
}

impl BitmapFrameAllocator {
    /// Covers `total_bytes` of physical memory and reserves the first megabyte.
    pub fn init(total_bytes: u64) -> Self {
        Self::with_reserved(total_bytes, RESERVED_FRAMES)
    }

    /// Same as [`init`](Self::init) with an explicit number of reserved frames
    /// at the bottom of memory.
    pub fn with_reserved(total_bytes: u64, reserved_frames: usize) -> Self {
        let total_bytes = if total_bytes > MAX_PHYSICAL_MEMORY {
            warn!(
                "Physical memory of {:#X} bytes exceeds the bitmap, clamping to {:#X}",
                total_bytes, MAX_PHYSICAL_MEMORY
            );
            MAX_PHYSICAL_MEMORY
        } else {
            total_bytes
        };

        let total_frames = total_bytes as usize / FRAME_SIZE;
        let reserved_frames = reserved_frames.min(total_frames);

        let mut allocator = Self {
            total_frames,
            free_frames: total_frames,
            reserved_frames,
            bitmap: vec![0; BITMAP_WORDS].into_boxed_slice(),
        };

        for frame_index in 0..reserved_frames {
            allocator.set_bit(frame_index);
        }

        debug!(
            "Frame bitmap covers {} frames, {} reserved",
            total_frames, reserved_frames
        );

        allocator
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Hands out the lowest-numbered free frame.
    pub fn allocate(&mut self) -> Option<PhysFrame> {
        // words past total_frames are never scanned
        let words = self.total_frames.div_ceil(BITMAP_ENTRY_SIZE);

        for word_index in 0..words {
            let word = self.bitmap[word_index];
            if word == FULL_BITMAP_ENTRY {
                continue;
            }

            let bit_index = (!word).trailing_zeros() as usize;
            let frame_index = word_index * BITMAP_ENTRY_SIZE + bit_index;
            if frame_index >= self.total_frames {
                break;
            }

            self.set_bit(frame_index);
            let addr = (frame_index * FRAME_SIZE) as u64;
            return Some(PhysFrame::containing_address(PhysAddr::new(addr)));
        }

        warn!("Out of physical frames");
        None
    }

    /// Returns a frame to the pool.
    ///
    /// Unlike the raw bitmap operation this refuses frames that are outside
    /// physical memory, inside the reserved region, or already free, so the
    /// free count can never drift.
    pub fn free(&mut self, frame: PhysFrame) -> Result<(), FrameError> {
        let frame_index = Self::frame_index(frame);

        if frame_index >= self.total_frames {
            error!("Freeing frame {:?} outside physical memory", frame);
            return Err(FrameError::OutOfRange(frame));
        }
        if frame_index < self.reserved_frames {
            error!("Freeing reserved frame {:?}", frame);
            return Err(FrameError::Reserved(frame));
        }
        if !self.is_bit_set(frame_index) {
            error!("Double free of frame {:?}", frame);
            return Err(FrameError::DoubleFree(frame));
        }

        self.clear_bit(frame_index);
        Ok(())
    }

    /// Check if frame is used. Frames past the end of memory count as used.
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        let frame_index = Self::frame_index(frame);
        frame_index >= self.total_frames || self.is_bit_set(frame_index)
    }

    pub fn stats(&self) -> MemoryInfo {
        let frame = FRAME_SIZE as u64;
        MemoryInfo {
            total: self.total_frames as u64 * frame,
            free: self.free_frames as u64 * frame,
            used: (self.total_frames - self.free_frames) as u64 * frame,
            reserved: self.reserved_frames as u64 * frame,
        }
    }

    fn frame_index(frame: PhysFrame) -> usize {
        frame.start_address().as_u64() as usize / FRAME_SIZE
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        self.bitmap[word_index] |= 1 << bit_index;
        self.free_frames -= 1;
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        debug_assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        self.bitmap[word_index] &= !(1 << bit_index);
        self.free_frames += 1;
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        (self.bitmap[word_index] & (1 << bit_index)) != 0
    }

    #[cfg(test)]
    fn bits_set(&self) -> usize {
        self.bitmap.iter().map(|word| word.count_ones() as usize).sum()
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate()
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    /// Errors are already logged by [`BitmapFrameAllocator::free`].
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let _ = self.free(frame);
    }
}
