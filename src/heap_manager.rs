//! First fit allocation over the page address space of one heap file. Only
//! free extents are tracked; occupied space is whatever is not in the free
//! list. The manager has no idea what lives on the pages it hands out.
//!
//! The bookkeeping here is cheap compared to the I/O around it, so a single
//! coarse mutex in the caller is enough; this type itself is plain
//! synchronous code.

use crate::page_formats::{PageOffset, PageRange};

/// Tuning knobs for the allocator.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// A split leftover smaller than this stays with the allocation instead
    /// of becoming a free extent nobody can use.
    pub min_viable_split: usize,
    /// When growing, enlarge by at least `capacity * growth_factor` so
    /// repeated small allocations don't grow one page at a time.
    pub growth_factor: f64,
    /// Free space ratio above which the free list is consolidated on free.
    pub defrag_free_ratio: f64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            min_viable_split: 4,
            growth_factor: 0.125,
            defrag_free_ratio: 0.5,
        }
    }
}

pub struct HeapManager {
    config: HeapConfig,
    /// Total units under management, free or not.
    capacity: usize,
    /// Disjoint free extents sorted by first page.
    free: Vec<PageRange>,
}

impl HeapManager {
    pub fn new(config: HeapConfig) -> HeapManager {
        HeapManager {
            config,
            capacity: 0,
            free: Vec::new(),
        }
    }

    /// Rebuild a manager from an existing layout: everything starts out
    /// allocated and a recovery scan subtracts the free areas it finds.
    pub fn subtractive_builder(config: HeapConfig) -> SubtractiveLayoutBuilder {
        SubtractiveLayoutBuilder {
            config,
            free: Vec::new(),
        }
    }

    /// First fit: scan the free extents in ascending start order and take the
    /// first one at least `size` units long. An exact fit consumes the whole
    /// extent; a larger one is split unless the leftover would be below the
    /// viable split size, in which case the caller gets the whole extent.
    ///
    /// With no fitting extent and `allow_enlarge` the address space grows and
    /// the new tail is allocated. Without `allow_enlarge` exhaustion is
    /// signalled by `None`, never an error, and capacity is unchanged.
    pub fn allocate(&mut self, size: usize, allow_enlarge: bool) -> Option<PageRange> {
        if size == 0 {
            return None;
        }

        for i in 0..self.free.len() {
            let extent = self.free[i];
            if extent.length() < size {
                continue;
            }

            let leftover = extent.length() - size;
            if leftover < self.config.min_viable_split {
                self.free.remove(i);
                return Some(extent);
            }

            let allocated = PageRange::from_length(extent.first, size);
            self.free[i] = PageRange::new(PageOffset(extent.first.0 + size), extent.last);
            return Some(allocated);
        }

        if !allow_enlarge {
            return None;
        }

        let growth = self.growth_amount(size);
        let allocated = PageRange::from_length(PageOffset(self.capacity), size);
        self.capacity += growth;
        trace!(
            "Heap grew by {} units to {} for an allocation of {}",
            growth,
            self.capacity,
            size
        );

        if growth > size {
            self.insert_free(PageRange::new(
                allocated.end(),
                PageOffset(self.capacity - 1),
            ));
        }
        Some(allocated)
    }

    /// Return a range to the free set, folding it into its neighbors. The
    /// range must have come out of `allocate` (sub-ranges of an allocation
    /// are fine); this is not validated.
    pub fn free(&mut self, range: PageRange) {
        self.insert_free(range);

        if self.capacity > 0
            && self.free_space() as f64 / self.capacity as f64 > self.config.defrag_free_ratio
        {
            self.consolidate();
        }
    }

    /// Total units under management.
    pub fn size(&self) -> usize {
        self.capacity
    }

    /// Units currently free.
    pub fn free_space(&self) -> usize {
        self.free.iter().map(PageRange::length).sum()
    }

    /// How many separate extents the free space is scattered across.
    pub fn free_extent_count(&self) -> usize {
        self.free.len()
    }

    fn growth_amount(&self, size: usize) -> usize {
        let amortized = (self.capacity as f64 * self.config.growth_factor).ceil() as usize;
        size.max(amortized)
    }

    fn insert_free(&mut self, range: PageRange) {
        let idx = self.free.partition_point(|e| e.first < range.first);
        self.free.insert(idx, range);

        // Fold forward first so idx stays valid for the backward fold
        if idx + 1 < self.free.len() && self.free[idx].touches(&self.free[idx + 1]) {
            self.free[idx] = self.free[idx].merge(&self.free[idx + 1]);
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].touches(&self.free[idx]) {
            self.free[idx - 1] = self.free[idx - 1].merge(&self.free[idx]);
            self.free.remove(idx);
        }
    }

    /// Bookkeeping only: coalesce free extents that ended up adjacent. No
    /// occupied page ever moves.
    fn consolidate(&mut self) {
        let before = self.free.len();
        let mut i = 0;
        while i + 1 < self.free.len() {
            if self.free[i].touches(&self.free[i + 1]) {
                self.free[i] = self.free[i].merge(&self.free[i + 1]);
                self.free.remove(i + 1);
            } else {
                i += 1;
            }
        }
        if self.free.len() != before {
            debug!(
                "Consolidated free extent records from {} down to {}",
                before,
                self.free.len()
            );
        }
    }
}

/// Builds a `HeapManager` over a layout that already exists on disk. The
/// space starts fully allocated; `mark_area_free` subtracts the areas a
/// recovery scan finds unused. Overlapping marks union instead of double
/// counting.
pub struct SubtractiveLayoutBuilder {
    config: HeapConfig,
    free: Vec<PageRange>,
}

impl SubtractiveLayoutBuilder {
    pub fn mark_area_free(&mut self, range: PageRange) {
        let idx = self.free.partition_point(|e| e.first < range.first);
        self.free.insert(idx, range);

        // A wide mark can swallow several neighbors on both sides
        let mut i = idx.saturating_sub(1);
        while i + 1 < self.free.len() {
            if self.free[i].touches(&self.free[i + 1]) {
                self.free[i] = self.free[i].merge(&self.free[i + 1]);
                self.free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Finalize over `total_units` pages. Marks reaching past the end are
    /// clipped; marks entirely past the end are dropped.
    pub fn build(self, total_units: usize) -> HeapManager {
        let mut free = Vec::with_capacity(self.free.len());
        for extent in self.free {
            if extent.first.0 >= total_units {
                continue;
            }
            let last = extent.last.min(PageOffset(total_units - 1));
            free.push(PageRange::new(extent.first, last));
        }

        HeapManager {
            config: self.config,
            capacity: total_units,
            free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> HeapConfig {
        HeapConfig {
            min_viable_split: 2,
            growth_factor: 0.0,
            defrag_free_ratio: 1.0,
        }
    }

    /// Free extents at [0,9] and [50,59] over 60 units.
    fn two_extent_manager(config: HeapConfig) -> HeapManager {
        let mut builder = HeapManager::subtractive_builder(config);
        builder.mark_area_free(PageRange::new(PageOffset(0), PageOffset(9)));
        builder.mark_area_free(PageRange::new(PageOffset(50), PageOffset(59)));
        builder.build(60)
    }

    #[test]
    fn test_first_fit_takes_lowest_extent() -> Result<(), Box<dyn std::error::Error>> {
        let mut heap = two_extent_manager(test_config());

        let range = heap.allocate(5, false).unwrap();
        assert_eq!(range, PageRange::new(PageOffset(0), PageOffset(4)));
        assert_eq!(heap.free_space(), 15);
        assert_eq!(heap.free_extent_count(), 2);

        // [5,9] must still be free, the next 5 unit request lands there
        let range = heap.allocate(5, false).unwrap();
        assert_eq!(range, PageRange::new(PageOffset(5), PageOffset(9)));
        Ok(())
    }

    #[test]
    fn test_exact_fit_consumes_extent() -> Result<(), Box<dyn std::error::Error>> {
        let mut heap = two_extent_manager(test_config());

        let range = heap.allocate(10, false).unwrap();
        assert_eq!(range, PageRange::new(PageOffset(0), PageOffset(9)));
        assert_eq!(heap.free_extent_count(), 1);
        Ok(())
    }

    #[test]
    fn test_small_leftover_is_overallocated() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = test_config();
        config.min_viable_split = 3;
        let mut heap = two_extent_manager(config);

        // Splitting would leave 2 units, below the viable size, so the whole
        // extent goes to the caller
        let range = heap.allocate(8, false).unwrap();
        assert_eq!(range, PageRange::new(PageOffset(0), PageOffset(9)));
        assert_eq!(heap.free_space(), 10);
        Ok(())
    }

    #[test]
    fn test_enlarge_grows_capacity() -> Result<(), Box<dyn std::error::Error>> {
        let mut heap = HeapManager::new(test_config());
        assert_eq!(heap.size(), 0);

        let range = heap.allocate(7, true).unwrap();
        assert_eq!(range, PageRange::new(PageOffset(0), PageOffset(6)));
        assert_eq!(heap.size(), 7);
        assert_eq!(heap.free_space(), 0);
        Ok(())
    }

    #[test]
    fn test_no_enlarge_returns_none() -> Result<(), Box<dyn std::error::Error>> {
        let mut heap = two_extent_manager(test_config());

        assert!(heap.allocate(11, false).is_none());
        assert_eq!(heap.size(), 60);
        assert_eq!(heap.free_space(), 20);
        Ok(())
    }

    #[test]
    fn test_growth_factor_amortizes() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = test_config();
        config.growth_factor = 0.5;
        let mut builder = HeapManager::subtractive_builder(config);
        builder.mark_area_free(PageRange::new(PageOffset(90), PageOffset(99)));
        let mut heap = builder.build(100);

        let range = heap.allocate(20, true).unwrap();
        assert_eq!(range, PageRange::new(PageOffset(100), PageOffset(119)));
        // Grew by capacity * 0.5 = 50, the surplus joins the free tail
        assert_eq!(heap.size(), 150);
        assert_eq!(heap.free_space(), 10 + 30);
        // The new tail folds into the preexisting trailing extent? It cannot,
        // the allocation sits between them
        assert_eq!(heap.free_extent_count(), 2);
        Ok(())
    }

    #[test]
    fn test_free_merges_with_neighbors() -> Result<(), Box<dyn std::error::Error>> {
        let mut heap = two_extent_manager(test_config());

        let a = heap.allocate(5, false).unwrap();
        let b = heap.allocate(5, false).unwrap();
        assert_eq!(heap.free_extent_count(), 1);

        heap.free(a);
        assert_eq!(heap.free_extent_count(), 2);

        // Freeing b bridges a and nothing else, [0,9] is whole again
        heap.free(b);
        assert_eq!(heap.free_extent_count(), 2);
        assert_eq!(heap.free_space(), 20);

        let range = heap.allocate(10, false).unwrap();
        assert_eq!(range, PageRange::new(PageOffset(0), PageOffset(9)));
        Ok(())
    }

    #[test]
    fn test_defrag_threshold_consolidates() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = test_config();
        config.defrag_free_ratio = 0.1;
        let mut heap = HeapManager::new(config);

        let a = heap.allocate(10, true).unwrap();
        let b = heap.allocate(10, true).unwrap();

        heap.free(a);
        heap.free(b);
        // Both frees crossed the threshold; everything is one extent again
        assert_eq!(heap.free_extent_count(), 1);
        assert_eq!(heap.free_space(), 20);
        Ok(())
    }

    #[test]
    fn test_builder_unions_overlapping_marks() -> Result<(), Box<dyn std::error::Error>> {
        let mut builder = HeapManager::subtractive_builder(test_config());
        builder.mark_area_free(PageRange::new(PageOffset(0), PageOffset(5)));
        builder.mark_area_free(PageRange::new(PageOffset(3), PageOffset(8)));
        builder.mark_area_free(PageRange::new(PageOffset(20), PageOffset(24)));

        let heap = builder.build(30);
        assert_eq!(heap.free_space(), 9 + 5);
        assert_eq!(heap.free_extent_count(), 2);
        Ok(())
    }

    #[test]
    fn test_builder_clips_to_capacity() -> Result<(), Box<dyn std::error::Error>> {
        let mut builder = HeapManager::subtractive_builder(test_config());
        builder.mark_area_free(PageRange::new(PageOffset(8), PageOffset(20)));
        builder.mark_area_free(PageRange::new(PageOffset(40), PageOffset(50)));

        let heap = builder.build(10);
        assert_eq!(heap.size(), 10);
        assert_eq!(heap.free_space(), 2);
        Ok(())
    }
}
