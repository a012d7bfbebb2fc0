//! Sparse page table with a residency budget.
//!
//! Pages exist for the whole stream up front (cheap: unallocated pages
//! carry no buffer), but at most `max_resident` of them hold a buffer,
//! transiently one more while a new page is being brought in. Eviction
//! walks the resident bounds inward toward the page being allocated, so
//! the pages farthest from the current working point go first, and the
//! evicted buffer is handed straight to the new page instead of going
//! back to the allocator.

use crate::page::Page;

pub struct PageTable {
    pages: Vec<Page>,
    page_frames: usize,
    frame_size: usize,
    first_page: usize,
    last_page: usize,
    used_pages: usize,
    max_resident: usize,
}

impl PageTable {
    /// `total_frames` sizes the table; `max_resident` is clamped to at
    /// least one page.
    pub fn new(
        page_frames: usize,
        frame_size: usize,
        total_frames: i64,
        max_resident: usize,
    ) -> PageTable {
        let total = total_frames.max(0) as usize;
        let count = total.div_ceil(page_frames);
        let mut pages = Vec::new();
        pages.resize_with(count, Page::default);
        PageTable {
            pages,
            page_frames,
            frame_size,
            first_page: 0,
            last_page: 0,
            used_pages: 0,
            max_resident: max_resident.max(1),
        }
    }

    pub fn page_frames(&self) -> usize {
        self.page_frames
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn resident_pages(&self) -> usize {
        self.used_pages
    }

    pub fn page(&self, idx: usize) -> &Page {
        &self.pages[idx]
    }

    pub fn page_mut(&mut self, idx: usize) -> &mut Page {
        &mut self.pages[idx]
    }

    /// Page index and in-page offset for a sample position, or `None`
    /// outside the stream.
    pub fn locate(&self, sample: i64) -> Option<(usize, usize)> {
        if sample < 0 {
            return None;
        }
        let px = (sample / self.page_frames as i64) as usize;
        if px >= self.pages.len() {
            return None;
        }
        Some((px, (sample % self.page_frames as i64) as usize))
    }

    /// Make page `idx` resident, evicting from the far bounds when over
    /// budget. Holds `used_pages <= max_resident + 1` at all times.
    pub fn ensure_allocated(&mut self, idx: usize) {
        if self.pages[idx].is_allocated() {
            return;
        }

        let mut stolen: Option<Vec<u8>> = None;
        if self.used_pages > self.max_resident {
            loop {
                if self.last_page > idx {
                    if self.pages[self.last_page].is_allocated() {
                        if stolen.is_some() {
                            break;
                        }
                        stolen = self.pages[self.last_page].take_buffer();
                        self.used_pages -= 1;
                        tracing::debug!(page = self.last_page, target = idx, "evicted page");
                    }
                    self.last_page -= 1;
                } else if self.first_page < idx {
                    if self.pages[self.first_page].is_allocated() {
                        if stolen.is_some() {
                            break;
                        }
                        stolen = self.pages[self.first_page].take_buffer();
                        self.used_pages -= 1;
                        tracing::debug!(page = self.first_page, target = idx, "evicted page");
                    }
                    self.first_page += 1;
                } else {
                    break;
                }
            }
        }

        let buf = stolen.unwrap_or_else(|| vec![0u8; self.page_frames * self.frame_size]);
        self.pages[idx].give_buffer(buf);

        if idx < self.first_page {
            self.first_page = idx;
        }
        if idx > self.last_page {
            self.last_page = idx;
        }
        self.used_pages += 1;
    }

    /// Drop validity from `start` for `count` samples.
    ///
    /// Coarse on purpose: within each touched page, everything from the
    /// in-page offset to the page end is dropped, so the count governs
    /// which pages are visited rather than the exact span.
    pub fn invalidate(&mut self, start: i64, count: u64) {
        let mut pos = start.max(0);
        let mut remaining = count;
        while remaining > 0 {
            let px = (pos / self.page_frames as i64) as usize;
            if px >= self.pages.len() {
                break;
            }
            let s0 = (pos % self.page_frames as i64) as usize;
            let n = remaining.min((self.page_frames - s0) as u64);
            self.pages[px].invalidate_from(s0);
            pos += n as i64;
            remaining -= n;
        }
    }

    /// Release every buffer and forget all cached ranges.
    pub fn reset(&mut self) {
        for page in &mut self.pages {
            page.reset();
        }
        self.first_page = 0;
        self.last_page = 0;
        self.used_pages = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_maps_and_bounds_checks() {
        let t = PageTable::new(16, 2, 100, 4);
        assert_eq!(t.page_count(), 7);
        assert_eq!(t.locate(0), Some((0, 0)));
        assert_eq!(t.locate(17), Some((1, 1)));
        assert_eq!(t.locate(-1), None);
        assert_eq!(t.locate(16 * 7), None);
    }

    #[test]
    fn pages_allocate_lazily() {
        let mut t = PageTable::new(16, 2, 100, 4);
        assert_eq!(t.resident_pages(), 0);
        t.ensure_allocated(3);
        assert!(t.page(3).is_allocated());
        assert!(!t.page(0).is_allocated());
        assert_eq!(t.resident_pages(), 1);
        t.ensure_allocated(3);
        assert_eq!(t.resident_pages(), 1);
    }

    #[test]
    fn residency_never_exceeds_budget_plus_one() {
        let mut t = PageTable::new(16, 1, 16 * 64, 2);
        for idx in 0..64 {
            t.ensure_allocated(idx);
            assert!(t.resident_pages() <= 3, "at page {idx}");
        }
        // Forward fill keeps the most recent pages.
        assert!(t.page(63).is_allocated());
        assert!(!t.page(0).is_allocated());
    }

    #[test]
    fn eviction_steals_from_the_far_bound() {
        let mut t = PageTable::new(16, 1, 16 * 64, 2);
        t.ensure_allocated(0);
        t.ensure_allocated(1);
        t.ensure_allocated(50);
        assert_eq!(t.resident_pages(), 3);
        // Allocating near the top evicts from the bottom.
        t.ensure_allocated(51);
        assert_eq!(t.resident_pages(), 3);
        assert!(!t.page(0).is_allocated());
        assert!(t.page(1).is_allocated());
        assert!(t.page(50).is_allocated());
        assert!(t.page(51).is_allocated());
    }

    #[test]
    fn alternating_far_allocations_terminate_under_tiny_budget() {
        let mut t = PageTable::new(16, 1, 16 * 64, 2);
        for k in 0..16 {
            t.ensure_allocated(k);
            assert!(t.resident_pages() <= 3, "low side, k={k}");
            t.ensure_allocated(63 - k);
            assert!(t.resident_pages() <= 3, "high side, k={k}");
        }
        assert!(t.page(48).is_allocated());
    }

    #[test]
    fn evicted_page_loses_its_ranges_with_its_buffer() {
        let mut t = PageTable::new(16, 1, 16 * 64, 1);
        t.ensure_allocated(0);
        t.page_mut(0).alloc_range(0, 16, 16);
        t.ensure_allocated(10);
        t.page_mut(10).alloc_range(0, 16, 16);
        // Third allocation trips the budget and reclaims page 0.
        t.ensure_allocated(11);
        assert!(!t.page(0).is_allocated());
        assert_eq!(t.page(0).range_a(), None);
        let mut buf = [0u8; 1];
        assert_eq!(t.page(0).copy_out(0, 1, &mut buf, 1), 0);
    }

    #[test]
    fn invalidate_is_coarse_within_a_page() {
        let mut t = PageTable::new(16, 1, 64, 4);
        t.ensure_allocated(0);
        t.ensure_allocated(1);
        t.page_mut(0).alloc_range(0, 16, 16);
        t.page_mut(1).alloc_range(0, 16, 16);
        // One sample at offset 4: the rest of page 0 goes too, page 1 stays.
        t.invalidate(4, 1);
        assert_eq!(
            t.page(0).range_a(),
            Some(crate::page::SampleRange { start: 0, end: 4 })
        );
        assert!(t.page(1).range_a().is_some());
        // A span crossing the boundary wipes page 1 from its start.
        t.invalidate(8, 20);
        assert_eq!(t.page(1).range_a(), None);
        assert_eq!(
            t.page(0).range_a(),
            Some(crate::page::SampleRange { start: 0, end: 4 })
        );
    }

    #[test]
    fn reset_releases_everything() {
        let mut t = PageTable::new(16, 1, 64, 4);
        t.ensure_allocated(0);
        t.page_mut(0).alloc_range(0, 8, 16);
        t.reset();
        assert_eq!(t.resident_pages(), 0);
        assert!(!t.page(0).is_allocated());
        assert_eq!(t.page(0).range_a(), None);
    }
}
