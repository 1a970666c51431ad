//! C5: virtual-memory arena.
//!
//! A sorted, flag-tagged list of non-overlapping `[start, end)` regions.
//! Kept as a plain sorted `Vec` rather than an intrusive list: the arena is
//! small (dozens of entries per address space, not millions) and a `Vec`
//! gives binary-search lookup and a trivial merge-on-insert rule.

use alloc::vec::Vec;

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const KERNEL  = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub flags: VmaFlags,
}

impl Vma {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.end && end > self.start
    }
}

#[derive(Debug)]
pub enum VmaError {
    Overlap,
    NoSpace,
    NotFound,
}

/// Sorted by `start`; invariant: no two entries overlap.
#[derive(Debug, Default)]
pub struct VmaArena {
    regions: Vec<Vma>,
    /// Lower/upper bound of the window `vma_alloc` searches in.
    window_start: u64,
    window_end: u64,
}

impl VmaArena {
    pub fn new(window_start: u64, window_end: u64) -> Self {
        Self {
            regions: Vec::new(),
            window_start,
            window_end,
        }
    }

    fn insert_index(&self, start: u64) -> usize {
        self.regions.partition_point(|v| v.start < start)
    }

    /// Splices in `[start, end)`, rejecting any overlap with an existing
    /// region. Merges into an abutting predecessor with identical flags
    /// instead of inserting a new node when possible.
    pub fn vma_add(&mut self, start: u64, end: u64, flags: VmaFlags) -> Result<(), VmaError> {
        if start >= end {
            return Err(VmaError::Overlap);
        }
        let idx = self.insert_index(start);
        if let Some(next) = self.regions.get(idx) {
            if next.overlaps(start, end) {
                return Err(VmaError::Overlap);
            }
        }
        if idx > 0 {
            let prev = &self.regions[idx - 1];
            if prev.overlaps(start, end) {
                return Err(VmaError::Overlap);
            }
            if prev.end == start && prev.flags == flags {
                self.regions[idx - 1].end = end;
                self.try_merge_forward(idx - 1);
                return Ok(());
            }
        }
        self.regions.insert(idx, Vma { start, end, flags });
        Ok(())
    }

    /// After extending `regions[i].end`, absorb a now-abutting successor
    /// with identical flags.
    fn try_merge_forward(&mut self, i: usize) {
        if let Some(next) = self.regions.get(i + 1) {
            if next.start == self.regions[i].end && next.flags == self.regions[i].flags {
                self.regions[i].end = next.end;
                self.regions.remove(i + 1);
            }
        }
    }

    /// Finds the lowest gap of at least `size` bytes inside the arena's
    /// window and inserts a region there, returning the chosen start.
    pub fn vma_alloc(&mut self, size: u64, flags: VmaFlags) -> Result<u64, VmaError> {
        if size == 0 {
            return Err(VmaError::NoSpace);
        }
        let mut cursor = self.window_start;
        for region in &self.regions {
            if region.start >= self.window_end {
                break;
            }
            let gap_end = region.start.max(cursor);
            if gap_end >= cursor && region.start.saturating_sub(cursor) >= size {
                let start = cursor;
                self.vma_add(start, start + size, flags)?;
                return Ok(start);
            }
            cursor = cursor.max(region.end);
        }
        if self.window_end.saturating_sub(cursor) >= size {
            let start = cursor;
            self.vma_add(start, start + size, flags)?;
            return Ok(start);
        }
        Err(VmaError::NoSpace)
    }

    /// Removes or trims the region covering `[start, end)`. An interior hole
    /// is permitted and leaves two surviving siblings.
    pub fn vma_free(&mut self, start: u64, end: u64) -> Result<(), VmaError> {
        if start >= end {
            return Err(VmaError::NotFound);
        }
        let idx = self
            .regions
            .iter()
            .position(|v| v.start <= start && v.end >= end)
            .ok_or(VmaError::NotFound)?;
        let region = self.regions[idx];

        match (region.start == start, region.end == end) {
            (true, true) => {
                self.regions.remove(idx);
            }
            (true, false) => {
                self.regions[idx].start = end;
            }
            (false, true) => {
                self.regions[idx].end = start;
            }
            (false, false) => {
                let tail = Vma {
                    start: end,
                    end: region.end,
                    flags: region.flags,
                };
                self.regions[idx].end = start;
                self.regions.insert(idx + 1, tail);
            }
        }
        Ok(())
    }

    pub fn regions(&self) -> &[Vma] {
        &self.regions
    }

    /// Holds for every valid arena: no two entries may overlap.
    #[cfg(test)]
    fn check_non_overlapping(&self) -> bool {
        self.regions
            .windows(2)
            .all(|w| w[0].end <= w[1].start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_free_round_trip_leaves_empty_arena() {
        let mut arena = VmaArena::new(0x1000, 0x10000);
        arena.vma_add(0x2000, 0x3000, VmaFlags::READ | VmaFlags::WRITE).unwrap();
        arena.vma_free(0x2000, 0x3000).unwrap();
        assert!(arena.regions().is_empty());
    }

    #[test]
    fn overlap_is_rejected() {
        let mut arena = VmaArena::new(0x1000, 0x10000);
        arena.vma_add(0x2000, 0x4000, VmaFlags::READ).unwrap();
        assert!(arena.vma_add(0x3000, 0x5000, VmaFlags::READ).is_err());
        assert!(arena.check_non_overlapping());
    }

    #[test]
    fn abutting_regions_with_same_flags_merge() {
        let mut arena = VmaArena::new(0x1000, 0x10000);
        arena.vma_add(0x2000, 0x3000, VmaFlags::READ).unwrap();
        arena.vma_add(0x3000, 0x4000, VmaFlags::READ).unwrap();
        assert_eq!(arena.regions().len(), 1);
        assert_eq!(arena.regions()[0].end, 0x4000);
    }

    #[test]
    fn interior_free_leaves_two_siblings() {
        let mut arena = VmaArena::new(0x1000, 0x10000);
        arena.vma_add(0x2000, 0x6000, VmaFlags::READ).unwrap();
        arena.vma_free(0x3000, 0x4000).unwrap();
        assert_eq!(arena.regions().len(), 2);
        assert!(arena.check_non_overlapping());
    }

    #[test]
    fn vma_alloc_picks_lowest_gap() {
        let mut arena = VmaArena::new(0x1000, 0x10000);
        arena.vma_add(0x1000, 0x2000, VmaFlags::READ).unwrap();
        let start = arena.vma_alloc(0x500, VmaFlags::WRITE).unwrap();
        assert_eq!(start, 0x2000);
    }
}
