//! C7: page-table manager.
//!
//! Recursive self-mapping: the top-level table has one entry pointing back
//! at itself, which makes every table at every level addressable as a plain
//! virtual array (`x86_64::structures::paging::RecursivePageTable`). The
//! hardware-facing leaf entries stay raw PTEs; the in-memory view Rust code
//! reasons about is the tagged `PageTableEntryKind` below.

use x86_64::PhysAddr;
use x86_64::VirtAddr;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, Page, PageTable, PageTableFlags, PhysFrame, RecursivePageTable,
    Size4KiB, mapper::MapToError,
};

use crate::memory::hhdm_offset::hhdm_offset;
use crate::memory::physical_bitmap::FRAME_SIZE;

/// Recursive index: entry 510 of the top-level table points back at itself,
/// so `0o177777_776_776_776_776_0000` (sign-extended) is the self-map window.
pub const RECURSIVE_INDEX: u16 = 510;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const WRITABLE = 1 << 0;
        const USER     = 1 << 1;
        const NO_EXEC  = 1 << 2;
    }
}

impl From<MapFlags> for PageTableFlags {
    fn from(f: MapFlags) -> Self {
        let mut flags = PageTableFlags::PRESENT;
        if f.contains(MapFlags::WRITABLE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if f.contains(MapFlags::USER) {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if f.contains(MapFlags::NO_EXEC) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }
}

/// In-memory view of a page-table entry, as read back out of the hardware
/// leaf. The hardware still only knows PRESENT/HUGE/etc bits; this enum is
/// the typed shape Rust code switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableEntryKind {
    Empty,
    Table(PhysFrame<Size4KiB>),
    Large4K(PhysFrame<Size4KiB>, MapFlags),
    Large2M(PhysAddr, MapFlags),
    Large1G(PhysAddr, MapFlags),
}

/// A bump view of the physical allocator satisfying `x86_64`'s
/// `FrameAllocator` trait, backed by C4.
pub struct BitmapFrameAllocator<'a>(pub &'a crate::memory::physical_bitmap::PhysicalFrameAllocator);

unsafe impl<'a> FrameAllocator<Size4KiB> for BitmapFrameAllocator<'a> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let addr = self.0.get_pages(1);
        if addr == 0 {
            return None;
        }
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

pub struct PageTableManager {
    level4_phys: PhysFrame<Size4KiB>,
}

impl PageTableManager {
    /// Wraps an already-built, already-self-mapped level-4 table.
    pub fn new(level4_phys: PhysFrame<Size4KiB>) -> Self {
        Self { level4_phys }
    }

    pub fn level4_frame(&self) -> PhysFrame<Size4KiB> {
        self.level4_phys
    }

    fn recursive_virt() -> VirtAddr {
        let idx = RECURSIVE_INDEX as u64;
        let raw = (idx << 39) | (idx << 30) | (idx << 21) | (idx << 12);
        // Sign-extend bit 47 into the canonical-address high bits.
        let canonical = if raw & (1 << 47) != 0 {
            raw | 0xFFFF_0000_0000_0000
        } else {
            raw
        };
        VirtAddr::new(canonical)
    }

    /// # Safety
    /// `level4_phys` must already carry a recursive self-map entry at
    /// `RECURSIVE_INDEX`, and the caller must not hold any other live
    /// `RecursivePageTable` for the same table.
    unsafe fn mapper(&self) -> RecursivePageTable<'static> {
        let table_ptr = Self::recursive_virt().as_mut_ptr::<PageTable>();
        unsafe { RecursivePageTable::new(&mut *table_ptr).expect("recursive self-map not set up") }
    }

    /// Walks top-down, allocating and zeroing intermediate tables from C4 as
    /// needed, and writes `n` leaf PTEs starting at `virt` to the
    /// physically-contiguous run starting at `phys`. If a leaf PTE was
    /// already present, flushes that single page's TLB entry before
    /// overwriting.
    pub fn map(
        &self,
        virt: VirtAddr,
        phys: PhysAddr,
        n: u64,
        flags: MapFlags,
        frames: &crate::memory::physical_bitmap::PhysicalFrameAllocator,
    ) -> Result<(), MapToError<Size4KiB>> {
        let mut mapper = unsafe { self.mapper() };
        let mut alloc = BitmapFrameAllocator(frames);
        let pt_flags: PageTableFlags = flags.into();

        for i in 0..n {
            let page = Page::<Size4KiB>::containing_address(virt + i * FRAME_SIZE);
            let frame = PhysFrame::containing_address(phys + i * FRAME_SIZE);

            // A leaf that's already present must be flushed, not silently
            // overwritten — stale TLB entries from a prior mapping at this
            // address would otherwise survive the update.
            if let Ok(old) = mapper.translate_page(page) {
                if old != frame {
                    use x86_64::instructions::tlb;
                    tlb::flush(page.start_address());
                }
            }

            unsafe {
                mapper
                    .map_to(page, frame, pt_flags, &mut alloc)?
                    .flush();
            }
        }
        Ok(())
    }

    /// Clears `n` leaf entries starting at `virt`. Intermediate tables are
    /// left in place — `page_map_drop` reclaims them at task exit.
    pub fn unmap(&self, virt: VirtAddr, n: u64) {
        let mut mapper = unsafe { self.mapper() };
        for i in 0..n {
            let page = Page::<Size4KiB>::containing_address(virt + i * FRAME_SIZE);
            if let Ok((_, flush)) = mapper.unmap(page) {
                flush.flush();
            }
        }
    }

    pub fn virt_to_phys(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let mapper = unsafe { self.mapper() };
        mapper
            .translate_page(Page::<Size4KiB>::containing_address(virt))
            .ok()
            .map(|frame| frame.start_address() + (virt.as_u64() & 0xFFF))
    }

    /// Allocates a fresh top-level table for a new task and shares the
    /// kernel half of the address space (entries 256..511, i.e. anything
    /// above the canonical midpoint) by copying those entries verbatim —
    /// the intermediate tables stay shared, not copy-on-write. User entries
    /// are left absent.
    pub fn page_map_copy(
        &self,
        frames: &crate::memory::physical_bitmap::PhysicalFrameAllocator,
    ) -> Option<PageTableManager> {
        let new_phys = frames.get_pages(1);
        if new_phys == 0 {
            return None;
        }
        let new_frame = PhysFrame::containing_address(PhysAddr::new(new_phys));
        let hhdm: u64 = hhdm_offset().into();

        let new_table = unsafe { &mut *((hhdm + new_phys) as *mut PageTable) };
        new_table.zero();

        let current = unsafe { &*((hhdm + self.level4_phys.start_address().as_u64()) as *const PageTable) };
        for i in 256..512usize {
            new_table[i] = current[i].clone();
        }
        new_table[RECURSIVE_INDEX as usize].set_frame(
            new_frame,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );

        Some(PageTableManager::new(new_frame))
    }

    /// Reclaims every present, non-shared intermediate table reachable from
    /// this root. Called once at task exit.
    pub fn page_map_drop(&self, frames: &crate::memory::physical_bitmap::PhysicalFrameAllocator) {
        let hhdm: u64 = hhdm_offset().into();
        let l4 = unsafe { &*((hhdm + self.level4_phys.start_address().as_u64()) as *const PageTable) };
        for i in 0..256usize {
            if l4[i].is_unused() {
                continue;
            }
            let l3_frame = l4[i].frame().unwrap();
            frames.put_pages(l3_frame.start_address().as_u64(), 1);
        }
        frames.put_pages(self.level4_phys.start_address().as_u64(), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_flags_translate_present_and_writable() {
        let flags: PageTableFlags = MapFlags::WRITABLE.into();
        assert!(flags.contains(PageTableFlags::PRESENT));
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert!(!flags.contains(PageTableFlags::USER_ACCESSIBLE));
    }
}
