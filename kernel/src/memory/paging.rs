//! Virtual memory manager
//!
//! Owns the four-level page table tree and the root register. Table pages
//! live in [`PhysicalMemory`] in the architectural entry format: physical
//! address in bits 12..51, bit 0 present, bit 1 writable.

use log::{debug, info, trace, warn};
use x86_64::{
    structures::paging::{
        FrameAllocator, FrameDeallocator, Page, PageTableFlags, PageTableIndex, PhysFrame,
        Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::constants::memory::{ENTRY_ADDRESS_MASK, KERNEL_BASE, PAGE_SIZE};

use super::{
    bitmap_frame_allocator::BitmapFrameAllocator, physical_memory::PhysicalMemory, MapError,
    MemoryError,
};

/// Flags given to every intermediate table entry the walk creates.
const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

pub struct VirtualMemoryManager {
    ram: PhysicalMemory,
    root: PhysFrame,
    root_reloads: u64,
}

impl VirtualMemoryManager {
    /// Takes ownership of physical memory and builds an empty top-level table.
    pub fn new(
        mut ram: PhysicalMemory,
        frame_allocator: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<Self, MapError> {
        let root = frame_allocator
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        ram.zero_frame(root)?;

        debug!("Top-level page table at {:?}", root.start_address());

        Ok(Self {
            ram,
            root,
            root_reloads: 0,
        })
    }

    /// Identity-maps `[0, identity_bytes)` and mirrors the same range at
    /// `KERNEL_BASE`, then reloads the root register.
    pub fn init(
        &mut self,
        identity_bytes: u64,
        frame_allocator: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(), MapError> {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        for addr in (0..identity_bytes).step_by(PAGE_SIZE as usize) {
            let frame = PhysFrame::containing_address(PhysAddr::new(addr));
            self.map(
                Page::containing_address(VirtAddr::new(addr)),
                frame,
                flags,
                frame_allocator,
            )?;
        }

        for addr in (0..identity_bytes).step_by(PAGE_SIZE as usize) {
            let frame = PhysFrame::containing_address(PhysAddr::new(addr));
            self.map(
                Page::containing_address(VirtAddr::new(addr + KERNEL_BASE)),
                frame,
                flags,
                frame_allocator,
            )?;
        }

        self.write_root(self.read_root());

        info!(
            "Identity mapped {:#X} bytes, mirrored at {:#X}",
            identity_bytes, KERNEL_BASE
        );
        Ok(())
    }

    pub fn read_root(&self) -> PhysFrame {
        self.root
    }

    /// Loads a new top-level table. Writing the current value still counts as
    /// a reload and drops any cached translations.
    pub fn write_root(&mut self, frame: PhysFrame) {
        trace!("Root register <- {:?}", frame.start_address());
        self.root = frame;
        self.root_reloads += 1;
    }

    pub fn root_reloads(&self) -> u64 {
        self.root_reloads
    }

    pub fn physical_memory(&self) -> &PhysicalMemory {
        &self.ram
    }

    /// Installs `page -> frame`. Missing intermediate tables are allocated
    /// and zeroed; an existing leaf entry is overwritten.
    pub fn map(
        &mut self,
        page: Page,
        frame: PhysFrame,
        flags: PageTableFlags,
        frame_allocator: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(), MapError> {
        let leaf_table = self.walk_create(page, frame_allocator)?;
        self.write_entry(
            leaf_table,
            page.p1_index(),
            frame.start_address().as_u64() | flags.bits(),
        )?;
        Ok(())
    }

    /// Clears the leaf entry for `page`. Unmapped pages are left alone. The
    /// frame that was mapped is not freed.
    pub fn unmap(&mut self, page: Page) -> Result<(), MapError> {
        if let Some(leaf_table) = self.walk(page)? {
            self.write_entry(leaf_table, page.p1_index(), 0)?;
        }
        Ok(())
    }

    /// Physical address that `addr` currently maps to, if any.
    pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        let page = Page::<Size4KiB>::containing_address(addr);
        let leaf_table = self.walk(page).ok()??;
        let entry = self.read_entry(leaf_table, page.p1_index()).ok()?;

        if !Self::entry_flags(entry).contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(PhysAddr::new(
            (entry & ENTRY_ADDRESS_MASK) | u64::from(addr.page_offset()),
        ))
    }

    /// Flags of the leaf entry for `page`, if it is mapped.
    pub fn flags(&self, page: Page) -> Option<PageTableFlags> {
        let leaf_table = self.walk(page).ok()??;
        let flags = Self::entry_flags(self.read_entry(leaf_table, page.p1_index()).ok()?);
        flags.contains(PageTableFlags::PRESENT).then_some(flags)
    }

    /// Allocates a fresh frame and maps `page` to it. The frame goes back to
    /// the allocator if the mapping cannot be built.
    pub fn create_mapping<A>(
        &mut self,
        page: Page,
        flags: PageTableFlags,
        frame_allocator: &mut A,
    ) -> Result<PhysFrame, MapError>
    where
        A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let frame = frame_allocator
            .allocate_frame()
            .ok_or(MapError::FrameAllocationFailed)?;
        if let Err(err) = self.map(page, frame, flags, frame_allocator) {
            unsafe { frame_allocator.deallocate_frame(frame) };
            return Err(err);
        }
        Ok(frame)
    }

    /// Unmaps `page` and hands its frame back to the allocator. A frame the
    /// allocator refuses (reserved, never handed out) leaves the mapping in
    /// place.
    pub fn remove_mapping(
        &mut self,
        page: Page,
        frame_allocator: &mut BitmapFrameAllocator,
    ) -> Result<PhysFrame, MapError> {
        let frame = self
            .translate(page.start_address())
            .map(PhysFrame::containing_address)
            .ok_or(MapError::NotMapped(page))?;
        frame_allocator.free(frame)?;
        self.unmap(page)?;
        Ok(frame)
    }

    /// Replaces the flags of an existing mapping.
    pub fn update_flags(&mut self, page: Page, flags: PageTableFlags) -> Result<(), MapError> {
        let leaf_table = self.walk(page)?.ok_or(MapError::NotMapped(page))?;
        let entry = self.read_entry(leaf_table, page.p1_index())?;
        if !Self::entry_flags(entry).contains(PageTableFlags::PRESENT) {
            return Err(MapError::NotMapped(page));
        }
        self.write_entry(
            leaf_table,
            page.p1_index(),
            (entry & ENTRY_ADDRESS_MASK) | flags.bits(),
        )?;
        Ok(())
    }

    /// Copies bytes out of virtual memory.
    pub fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while done < buf.len() {
            let virt = addr + done as u64;
            let chunk = (PAGE_SIZE - u64::from(virt.page_offset())) as usize;
            let chunk = chunk.min(buf.len() - done);
            let phys = self
                .translate(virt)
                .ok_or(MemoryError::PageNotMapped(virt))?;
            self.ram.read(phys, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies bytes into virtual memory.
    pub fn write(&mut self, addr: VirtAddr, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        while done < bytes.len() {
            let virt = addr + done as u64;
            let chunk = (PAGE_SIZE - u64::from(virt.page_offset())) as usize;
            let chunk = chunk.min(bytes.len() - done);
            let phys = self
                .translate(virt)
                .ok_or(MemoryError::PageNotMapped(virt))?;
            self.ram.write(phys, &bytes[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    pub fn read_u64(&self, addr: VirtAddr) -> Result<u64, MemoryError> {
        let mut word = [0u8; 8];
        self.read(addr, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    pub fn write_u64(&mut self, addr: VirtAddr, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn table_indices(page: Page) -> [PageTableIndex; 3] {
        [page.p4_index(), page.p3_index(), page.p2_index()]
    }

    /// Non-allocating walk down to the leaf table of `page`.
    fn walk(&self, page: Page) -> Result<Option<PhysFrame>, MemoryError> {
        let mut table = self.root;
        for index in Self::table_indices(page) {
            match self.next_table(table, index)? {
                Some(next) => table = next,
                None => return Ok(None),
            }
        }
        Ok(Some(table))
    }

    /// Walk that builds every missing level on the way down.
    fn walk_create(
        &mut self,
        page: Page,
        frame_allocator: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<PhysFrame, MapError> {
        let mut table = self.root;
        for index in Self::table_indices(page) {
            table = match self.next_table(table, index)? {
                Some(next) => next,
                None => {
                    let Some(new_table) = frame_allocator.allocate_frame() else {
                        warn!("No frame left for a page table while mapping {:?}", page);
                        return Err(MapError::FrameAllocationFailed);
                    };
                    self.ram.zero_frame(new_table)?;
                    self.write_entry(
                        table,
                        index,
                        new_table.start_address().as_u64() | TABLE_FLAGS.bits(),
                    )?;
                    trace!("New page table at {:?}", new_table.start_address());
                    new_table
                }
            };
        }
        Ok(table)
    }

    fn next_table(
        &self,
        table: PhysFrame,
        index: PageTableIndex,
    ) -> Result<Option<PhysFrame>, MemoryError> {
        let entry = self.read_entry(table, index)?;
        if !Self::entry_flags(entry).contains(PageTableFlags::PRESENT) {
            return Ok(None);
        }
        Ok(Some(PhysFrame::containing_address(PhysAddr::new(
            entry & ENTRY_ADDRESS_MASK,
        ))))
    }

    fn entry_address(table: PhysFrame, index: PageTableIndex) -> PhysAddr {
        table.start_address() + u64::from(index) * 8
    }

    fn read_entry(&self, table: PhysFrame, index: PageTableIndex) -> Result<u64, MemoryError> {
        self.ram.read_u64(Self::entry_address(table, index))
    }

    fn write_entry(
        &mut self,
        table: PhysFrame,
        index: PageTableIndex,
        entry: u64,
    ) -> Result<(), MemoryError> {
        self.ram.write_u64(Self::entry_address(table, index), entry)
    }

    fn entry_flags(entry: u64) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(entry)
    }
}
