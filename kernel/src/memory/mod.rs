//! Memory subsystem: physical frames, page tables and the kernel heap.

pub mod bitmap_frame_allocator;
pub mod heap;
pub mod paging;
pub mod physical_memory;

use x86_64::{structures::paging::Page, structures::paging::PhysFrame, PhysAddr, VirtAddr};

/// Memory statistics in bytes, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub reserved: u64,
}

impl core::fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Memory Info:")?;
        writeln!(f, "  Total: {} bytes", self.total)?;
        writeln!(f, "  Free:  {} bytes", self.free)?;
        writeln!(f, "  Used:  {} bytes", self.used)?;
        write!(f, "  Reserved: {} bytes", self.reserved)
    }
}

/// Raw access to physical or virtual memory failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfRange(PhysAddr),
    PageNotMapped(VirtAddr),
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::OutOfRange(addr) => {
                write!(f, "Physical address {:#x} is outside memory", addr.as_u64())
            }
            MemoryError::PageNotMapped(addr) => {
                write!(f, "Virtual address {:#x} is not mapped", addr.as_u64())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    DoubleFree(PhysFrame),
    OutOfRange(PhysFrame),
    Reserved(PhysFrame),
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::DoubleFree(frame) => {
                write!(f, "Frame {:#x} is already free", frame.start_address().as_u64())
            }
            FrameError::OutOfRange(frame) => {
                write!(f, "Frame {:#x} is outside memory", frame.start_address().as_u64())
            }
            FrameError::Reserved(frame) => {
                write!(f, "Frame {:#x} is reserved", frame.start_address().as_u64())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    FrameAllocationFailed,
    NotMapped(Page),
    /// The frame allocator refused to take a frame back.
    Frame(FrameError),
    Memory(MemoryError),
}

impl From<FrameError> for MapError {
    fn from(err: FrameError) -> Self {
        MapError::Frame(err)
    }
}

impl From<MemoryError> for MapError {
    fn from(err: MemoryError) -> Self {
        MapError::Memory(err)
    }
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MapError::FrameAllocationFailed => write!(f, "No frame available for the mapping"),
            MapError::NotMapped(page) => {
                write!(f, "Page {:#x} is not mapped", page.start_address().as_u64())
            }
            MapError::Frame(err) => write!(f, "{}", err),
            MapError::Memory(err) => write!(f, "{}", err),
        }
    }
}
