//! One cache page: a fixed-capacity slab of contiguous sample positions
//! with up to two valid ranges.
//!
//! Two ranges are enough because a page is filled by at most two decode
//! directions meeting in the middle (a forward fill and a later fill
//! that started before the page). [`Page::alloc_range`] merges a new
//! span into the existing ranges when it touches them; a third disjoint
//! span evicts whichever range the placement rule discards.
//!
//! Offsets here are frame positions within the page, `0..capacity`.

/// Half-open span of valid frames within a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleRange {
    pub start: usize,
    pub end: usize,
}

/// `a` sits before `b` whenever both exist; `b` never exists alone.
#[derive(Debug, Default)]
pub struct Page {
    data: Option<Vec<u8>>,
    a: Option<SampleRange>,
    b: Option<SampleRange>,
}

impl Page {
    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    pub fn range_a(&self) -> Option<SampleRange> {
        self.a
    }

    pub fn range_b(&self) -> Option<SampleRange> {
        self.b
    }

    /// Hand the backing buffer to another page, dropping all ranges.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.a = None;
        self.b = None;
        self.data.take()
    }

    pub fn give_buffer(&mut self, buf: Vec<u8>) {
        self.data = Some(buf);
    }

    pub fn reset(&mut self) {
        *self = Page::default();
    }

    /// Copy valid frames starting at `offset` into `dst`, stopping at the
    /// end of the containing range. Returns frames copied, 0 when
    /// `offset` is not valid.
    pub fn copy_out(&self, offset: usize, count: usize, dst: &mut [u8], stride: usize) -> usize {
        let Some(data) = &self.data else {
            return 0;
        };
        for r in [self.a, self.b].into_iter().flatten() {
            if r.start <= offset && r.end > offset {
                let n = count.min(r.end - offset);
                dst[..n * stride].copy_from_slice(&data[offset * stride..(offset + n) * stride]);
                return n;
            }
        }
        0
    }

    /// Length of the invalid run at `offset`: up to the start of the next
    /// valid range, or to the end of the page. 0 when `offset` is valid.
    pub fn empty_run(&self, offset: usize, count: usize, capacity: usize) -> usize {
        for r in [self.a, self.b].into_iter().flatten() {
            if r.start <= offset && r.end > offset {
                return 0;
            }
        }
        if let Some(a) = self.a {
            if a.start > offset {
                return count.min(a.start - offset);
            }
        }
        if let Some(b) = self.b {
            if b.start > offset {
                return count.min(b.start - offset);
            }
        }
        count.min(capacity - offset)
    }

    /// Reserve `[offset, offset + count)` for writing, clipped to the end
    /// of the page. Returns the reserved length and whether the caller
    /// must actually write it (`false` when the span was already valid).
    pub fn alloc_range(&mut self, offset: usize, count: usize, capacity: usize) -> (usize, bool) {
        let n = count.min(capacity - offset);
        if n == 0 {
            return (0, false);
        }
        let end = offset + n;

        if let Some(a) = self.a {
            if a.start <= offset && a.end >= end {
                return (n, false);
            }
        }
        if let Some(b) = self.b {
            if b.start <= offset && b.end >= end {
                return (n, false);
            }
        }

        let Some(mut a) = self.a else {
            self.a = Some(SampleRange { start: offset, end });
            return (n, true);
        };

        if a.start <= end && a.end >= end {
            // extend a down
            self.a = Some(SampleRange {
                start: offset,
                end: a.end,
            });
            return (n, true);
        }

        if a.start <= offset && a.end >= offset {
            // extend a up; reaching b absorbs b outright, keeping its end
            // even when the new span stops short of it
            a.end = end;
            if let Some(b) = self.b {
                if a.end >= b.start {
                    a.end = b.end;
                    self.b = None;
                }
            }
            self.a = Some(a);
            return (n, true);
        }

        if let Some(mut b) = self.b {
            if b.start <= end && b.end >= end {
                // extend b down
                b.start = offset;
                self.b = Some(b);
                return (n, true);
            }
            if b.start <= offset && b.end >= offset {
                // extend b up
                b.end = end;
                self.b = Some(b);
                return (n, true);
            }
            tracing::debug!(
                dropped_start = b.start,
                dropped_end = b.end,
                new_start = offset,
                "third disjoint span on page, dropping a range"
            );
        }

        if a.end < offset {
            // insert after a
            self.b = Some(SampleRange { start: offset, end });
        } else {
            // insert before a
            self.b = Some(a);
            self.a = Some(SampleRange { start: offset, end });
        }
        (n, true)
    }

    /// Drop validity for every frame at or after `offset`.
    pub fn invalidate_from(&mut self, offset: usize) {
        if let Some(a) = self.a {
            if offset <= a.start {
                self.a = None;
                self.b = None;
            } else if offset < a.end {
                self.a = Some(SampleRange {
                    start: a.start,
                    end: offset,
                });
                self.b = None;
            } else if let Some(b) = self.b {
                if offset <= b.start {
                    self.b = None;
                } else if offset < b.end {
                    self.b = Some(SampleRange {
                        start: b.start,
                        end: offset,
                    });
                }
            }
        }
    }

    /// Writable bytes for a span previously reserved with `alloc_range`.
    pub fn bytes_mut(&mut self, offset: usize, frames: usize, stride: usize) -> Option<&mut [u8]> {
        self.data
            .as_mut()
            .map(|d| &mut d[offset * stride..(offset + frames) * stride])
    }
}
