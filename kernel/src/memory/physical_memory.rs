//! Physical memory
//!
//! Backing store for everything the kernel places in "RAM": page table pages,
//! heap blocks and file data. Frames are materialised on first write; a frame
//! that was never written reads back as zeroes.

use alloc::{boxed::Box, collections::BTreeMap};
use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::constants::memory::FRAME_SIZE;

use super::MemoryError;

type FrameBytes = Box<[u8; FRAME_SIZE]>;

pub struct PhysicalMemory {
    size: u64,
    frames: BTreeMap<u64, FrameBytes>,
}

impl PhysicalMemory {
    /// Creates an arena covering `[0, size)`, rounded down to whole frames.
    pub fn new(size: u64) -> Self {
        Self {
            size: size - size % FRAME_SIZE as u64,
            frames: BTreeMap::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of frames that have actually been written to.
    pub fn resident_frames(&self) -> usize {
        self.frames.len()
    }

    fn check_range(&self, addr: PhysAddr, len: usize) -> Result<(), MemoryError> {
        let end = addr
            .as_u64()
            .checked_add(len as u64)
            .ok_or(MemoryError::OutOfRange(addr))?;
        if end > self.size {
            return Err(MemoryError::OutOfRange(addr));
        }
        Ok(())
    }

    /// Copies `buf.len()` bytes starting at `addr` into `buf`.
    pub fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check_range(addr, buf.len())?;

        let mut cursor = addr.as_u64();
        let mut done = 0;
        while done < buf.len() {
            let offset = (cursor % FRAME_SIZE as u64) as usize;
            let chunk = (FRAME_SIZE - offset).min(buf.len() - done);
            match self.frames.get(&(cursor / FRAME_SIZE as u64)) {
                Some(frame) => buf[done..done + chunk].copy_from_slice(&frame[offset..offset + chunk]),
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
            cursor += chunk as u64;
        }
        Ok(())
    }

    /// Copies `bytes` into memory starting at `addr`.
    pub fn write(&mut self, addr: PhysAddr, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check_range(addr, bytes.len())?;

        let mut cursor = addr.as_u64();
        let mut done = 0;
        while done < bytes.len() {
            let offset = (cursor % FRAME_SIZE as u64) as usize;
            let chunk = (FRAME_SIZE - offset).min(bytes.len() - done);
            let frame = self
                .frames
                .entry(cursor / FRAME_SIZE as u64)
                .or_insert_with(|| Box::new([0; FRAME_SIZE]));
            frame[offset..offset + chunk].copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
            cursor += chunk as u64;
        }
        Ok(())
    }

    pub fn read_u64(&self, addr: PhysAddr) -> Result<u64, MemoryError> {
        let mut word = [0u8; 8];
        self.read(addr, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    pub fn write_u64(&mut self, addr: PhysAddr, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Fills a whole frame with zeroes.
    pub fn zero_frame(&mut self, frame: PhysFrame<Size4KiB>) -> Result<(), MemoryError> {
        self.check_range(frame.start_address(), FRAME_SIZE)?;
        // an absent frame already reads as zero
        self.frames.remove(&(frame.start_address().as_u64() / FRAME_SIZE as u64));
        Ok(())
    }
}
