//! Allocation and free paths: free-list search, splitting, eager
//! coalescing and the fragmentation-reduction step that shrinks a
//! power-of-two allocation back to the requested length.

use memaddr::largest_aligned_run;
use tracing::debug;

use crate::memspace::SpaceState;
use crate::status::{BufState, Status, SHIFT_COMPLEX, SHIFT_SIZE3};
use crate::{BuddyError, Result};

/// Bound on the `allocate_range` forward scan, in minimum buffers.
const RANGE_SCAN_LIMIT: u32 = 64 * 1024;

#[inline]
fn ceil_log2_u32(n: u32) -> u32 {
    debug_assert!(n > 0);
    32 - (n - 1).leading_zeros()
}

impl SpaceState {
    pub fn allocate(&mut self, size: u64, color: Option<u32>) -> Result<u64> {
        if size == 0 || size > self.geo.max_buf_size() {
            return Err(BuddyError::BadParam);
        }
        let nmin = size.div_ceil(self.geo.min_buf_size()) as u32;
        let want = ceil_log2_u32(nmin);
        if let Some(c) = color {
            if c >= self.geo.colors_at(want) {
                return Err(BuddyError::BadParam);
            }
        }

        let Some((head, found)) = self.find_free(want, color) else {
            debug!(
                name = self.geo.name.as_str(),
                size,
                color = ?color,
                "allocation failed: no suitable free buffer"
            );
            return Err(BuddyError::NoResources);
        };
        let buf = self.split_to(head, found, want, color);
        self.mark_inuse(buf, nmin);
        // give back what the power-of-two rounding over-covered
        self.free_span(buf + nmin, buf + (1u32 << want));

        debug_assert!(color.is_none() || self.geo.color_of(buf, want) == color.unwrap());
        Ok(self.geo.buf_to_addr(buf))
    }

    /// Recover the stored run length from the head status, give the run
    /// back as power-of-two extents and return the freed byte count.
    pub fn free(&mut self, addr: u64) -> Result<u64> {
        let buf = self.geo.addr_to_buf(addr)?;
        if buf >= self.max_buf || !self.blocks[self.block_index(buf)].is_realized() {
            return Err(BuddyError::BadParam);
        }

        let st = self.status(buf);
        // freeing anything but an in-use head is metadata corruption
        assert!(
            st.state() == Some(BufState::InUse),
            "{}: free of non-in-use buffer {buf} (status {:#04x})",
            self.geo.name,
            st.0
        );

        let nmin = match st.shift() {
            SHIFT_SIZE3 => {
                self.used.size3_runs -= 1;
                3
            }
            SHIFT_COMPLEX => {
                let n = u32::from_le_bytes([
                    self.status_raw(buf + 1),
                    self.status_raw(buf + 2),
                    self.status_raw(buf + 3),
                    0,
                ]);
                assert!(
                    n > 4 && buf + n <= self.max_buf,
                    "{}: corrupt complex run length {n} at buffer {buf}",
                    self.geo.name
                );
                // the overlay bytes go back to being interior markers
                for b in buf + 1..buf + 4 {
                    self.set_status(b, Status::INTERIOR);
                }
                self.used.complex_runs -= 1;
                self.used.complex_bufs -= n as u64;
                n
            }
            shift => {
                let shift = shift as u32;
                assert!(
                    (self.geo.min_shift..=self.geo.max_shift).contains(&shift),
                    "{}: corrupt in-use shift {shift} at buffer {buf}",
                    self.geo.name
                );
                let rel = shift - self.geo.min_shift;
                assert!(
                    buf & ((1 << rel) - 1) == 0,
                    "{}: misaligned in-use head {buf} at shift {shift}",
                    self.geo.name
                );
                self.used.pow2_runs[rel as usize] -= 1;
                1u32 << rel
            }
        };

        self.set_status(buf, Status::INTERIOR);
        self.free_span(buf, buf + nmin);
        Ok((nmin as u64) << self.geo.min_shift)
    }

    /// Allocate the free run that starts exactly at `*addr`.
    ///
    /// On success `*size` receives the run's byte length. On failure
    /// `*addr` advances to the next free-run head found within a bounded
    /// scan (or past the scanned region), so callers can enumerate free
    /// extents by looping. `*addr` must lie on a run boundary: the range
    /// start or an address this function produced.
    pub fn allocate_range(&mut self, addr: &mut u64, size: &mut u64) -> Result<()> {
        let mut buf = self.geo.addr_to_buf(*addr)?;
        if buf >= self.max_buf {
            return Err(BuddyError::BadParam);
        }

        // the run at *addr itself
        if self.blocks[self.block_index(buf)].is_realized() {
            if let Some(rel) = self.free_head_at(buf) {
                self.take_whole_run(buf, rel);
                *size = (1u64 << rel) << self.geo.min_shift;
                return Ok(());
            }
        }

        let mut scanned = 0u32;
        while scanned < RANGE_SCAN_LIMIT && buf < self.max_buf {
            let bidx = self.block_index(buf);
            if !self.blocks[bidx].is_realized() {
                let next = self.blocks[bidx].base_buf + self.blocks[bidx].num_bufs;
                scanned += next - buf;
                buf = next;
                continue;
            }
            if self.free_head_at(buf).is_some() {
                *addr = self.geo.buf_to_addr(buf);
                return Err(BuddyError::NoResources);
            }
            let skip = self.run_extent(buf);
            scanned += skip;
            buf += skip;
        }
        *addr = self.geo.buf_to_addr(buf.min(self.max_buf));
        Err(BuddyError::NoResources)
    }

    // === Internals === //

    /// Walk the free lists from `want` upward; when the color is
    /// unconstrained every color at a level is tried before moving up.
    fn find_free(&mut self, want: u32, color: Option<u32>) -> Option<(u32, u32)> {
        for r in want..=self.geo.rel_max() {
            match color {
                Some(c) => {
                    // the covering buffer's color halves at each level up
                    let c_at_r = c >> (r - want);
                    if let Some(buf) = self.list_pop(r, c_at_r) {
                        return Some((buf, r));
                    }
                }
                None => {
                    for c in 0..self.geo.colors_at(r) {
                        if let Some(buf) = self.list_pop(r, c) {
                            return Some((buf, r));
                        }
                    }
                }
            }
        }
        None
    }

    /// Split `buf` from `from` down to `to`, keeping the half whose
    /// color matches (the lower half when unconstrained) and freeing the
    /// other at each level.
    fn split_to(&mut self, mut buf: u32, from: u32, to: u32, color: Option<u32>) -> u32 {
        let mut r = from;
        while r > to {
            r -= 1;
            let lower = buf;
            let upper = buf + (1u32 << r);
            let (keep, give) = match color {
                Some(c) => {
                    let want_color = c >> (r - to);
                    if self.geo.color_of(lower, r) == want_color {
                        (lower, upper)
                    } else {
                        debug_assert_eq!(self.geo.color_of(upper, r), want_color);
                        (upper, lower)
                    }
                }
                None => (lower, upper),
            };
            self.set_status(
                give,
                Status::new(BufState::Free, (self.geo.min_shift + r) as u8),
            );
            self.list_push(r, self.geo.color_of(give, r), give);
            buf = keep;
        }
        buf
    }

    /// Tag an in-use run head with the size encoding for `nmin` minimum
    /// buffers: its log2 when a power of two, the three-buffer sentinel,
    /// or the complex sentinel with the length in the next three bytes.
    fn mark_inuse(&mut self, buf: u32, nmin: u32) {
        if nmin.is_power_of_two() {
            let rel = nmin.trailing_zeros();
            self.set_status(
                buf,
                Status::new(BufState::InUse, (self.geo.min_shift + rel) as u8),
            );
            self.used.pow2_runs[rel as usize] += 1;
        } else if nmin == 3 {
            self.set_status(buf, Status::new(BufState::InUse, SHIFT_SIZE3));
            self.used.size3_runs += 1;
        } else {
            debug_assert!(nmin > 4);
            self.set_status(buf, Status::new(BufState::InUse, SHIFT_COMPLEX));
            let bytes = nmin.to_le_bytes();
            self.set_status_raw(buf + 1, bytes[0]);
            self.set_status_raw(buf + 2, bytes[1]);
            self.set_status_raw(buf + 3, bytes[2]);
            self.used.complex_runs += 1;
            self.used.complex_bufs += nmin as u64;
        }
    }

    /// Free `[from, end)` as maximal aligned power-of-two runs. All
    /// covered bytes must already carry the interior marker.
    fn free_span(&mut self, from: u32, end: u32) {
        let mut pos = from;
        while pos < end {
            let rel = largest_aligned_run(pos as u64, (end - pos) as u64, self.geo.rel_max());
            self.free_run(pos, rel);
            pos += 1u32 << rel;
        }
    }

    /// Put one power-of-two run on its free list, eagerly coalescing
    /// with its buddy for as long as the buddy is an entirely-free run of
    /// the same size.
    pub(crate) fn free_run(&mut self, mut buf: u32, mut rel: u32) {
        debug_assert!(buf & ((1 << rel) - 1) == 0);
        loop {
            if rel == self.geo.rel_max() {
                break;
            }
            let buddy = buf ^ (1u32 << rel);
            if buddy >= self.max_buf {
                break;
            }
            if !self
                .status(buddy)
                .is_free_head((self.geo.min_shift + rel) as u8)
            {
                break;
            }
            self.list_remove(rel, self.geo.color_of(buddy, rel), buddy);
            // both former heads are interior of the combined run
            self.set_status(buddy, Status::INTERIOR);
            self.set_status(buf, Status::INTERIOR);
            buf &= !(1u32 << rel);
            rel += 1;
        }
        self.set_status(
            buf,
            Status::new(BufState::Free, (self.geo.min_shift + rel) as u8),
        );
        self.list_push(rel, self.geo.color_of(buf, rel), buf);
    }

    /// Relative shift of the free run headed at `buf`, if there is one.
    fn free_head_at(&self, buf: u32) -> Option<u32> {
        let st = self.status(buf);
        if st.state() != Some(BufState::Free) {
            return None;
        }
        let shift = st.shift() as u32;
        assert!(
            (self.geo.min_shift..=self.geo.max_shift).contains(&shift),
            "{}: corrupt free-head shift {shift} at buffer {buf}",
            self.geo.name
        );
        Some(shift - self.geo.min_shift)
    }

    /// Remove the run headed at `buf` from its list and mark the whole
    /// run in use (`allocate_range` takes runs as-is, no splitting).
    fn take_whole_run(&mut self, buf: u32, rel: u32) {
        self.list_remove(rel, self.geo.color_of(buf, rel), buf);
        self.mark_inuse(buf, 1u32 << rel);
    }

    /// Length, in minimum buffers, of the run whose head is at `buf`;
    /// single buffer for reserved and interior bytes (resynchronizing
    /// scans step over them).
    fn run_extent(&self, buf: u32) -> u32 {
        let st = self.status(buf);
        match st.state() {
            Some(BufState::InUse) => match st.shift() {
                SHIFT_SIZE3 => 3,
                SHIFT_COMPLEX => u32::from_le_bytes([
                    self.status_raw(buf + 1),
                    self.status_raw(buf + 2),
                    self.status_raw(buf + 3),
                    0,
                ]),
                shift => 1u32 << (shift as u32 - self.geo.min_shift),
            },
            Some(BufState::Free) => 1u32 << (st.shift() as u32 - self.geo.min_shift),
            Some(BufState::Reserved) | None => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::layout::{AddrRange, Geometry, MemspaceKind, RangeDesc};
    use crate::memspace::SpaceState;
    use crate::status::{BufState, SHIFT_COMPLEX, SHIFT_SIZE3};
    use crate::BuddyError;

    fn desc(color_bits: u32) -> RangeDesc {
        RangeDesc {
            name: "alloc-test".into(),
            start: 0,
            len: 0x10000,
            max_len: 0,
            min_buf_size: 0x100,
            max_buf_size: 0x1000,
            color_bits,
            block_size_hint: 0,
        }
    }

    fn fresh(color_bits: u32) -> SpaceState {
        let d = desc(color_bits);
        let geo = Geometry::new(&d, MemspaceKind::Static).unwrap();
        let storage = vec![0u8; geo.create_storage_bytes(d.len) as usize];
        let mut s = SpaceState::new(geo, storage, d.len).unwrap();
        s.carve(AddrRange {
            start: 0,
            len: 0x10000,
        })
        .unwrap();
        s.check();
        s
    }

    #[test]
    fn rejects_zero_and_oversize() {
        let mut s = fresh(0);
        assert_eq!(s.allocate(0, None).unwrap_err(), BuddyError::BadParam);
        assert_eq!(s.allocate(0x1001, None).unwrap_err(), BuddyError::BadParam);
    }

    #[test]
    fn freed_buffer_is_reused_first() {
        // two small allocations, a third of double size, free the middle
        // one: the next same-size allocation must land exactly there
        let mut s = fresh(0);
        let _a = s.allocate(0x100, None).unwrap();
        let b = s.allocate(0x100, None).unwrap();
        let _c = s.allocate(0x200, None).unwrap();
        s.check();
        assert_eq!(s.free(b).unwrap(), 0x100);
        s.check();
        assert_eq!(s.allocate(0x100, None).unwrap(), b);
        s.check();
    }

    #[test]
    fn partial_allocation_frees_the_tail() {
        // 0x500 rounds to a 0x1000 buddy; the defragmenter keeps 0x500
        // and gives 0x300 back as a 0x100 run plus a 0x200 run
        let mut s = fresh(0);
        let free_before = s.free_bufs();
        let a = s.allocate(0x500, None).unwrap();
        s.check();
        assert_eq!(free_before - s.free_bufs(), 5);

        // complex encoding: head sentinel plus 24-bit length overlay
        let head = (a >> 8) as u32;
        assert_eq!(s.status(head).shift(), SHIFT_COMPLEX);
        assert_eq!(s.status_raw(head + 1), 5);
        assert_eq!(s.status_raw(head + 2), 0);
        assert_eq!(s.status_raw(head + 3), 0);

        assert_eq!(s.free(a).unwrap(), 0x500);
        s.check();
        assert_eq!(s.free_bufs(), free_before);
    }

    #[test]
    fn three_buffer_runs_use_the_sentinel() {
        let mut s = fresh(0);
        let a = s.allocate(0x300, None).unwrap();
        s.check();
        assert_eq!(s.status((a >> 8) as u32).shift(), SHIFT_SIZE3);
        assert_eq!(s.free(a).unwrap(), 0x300);
        s.check();
    }

    #[test]
    fn free_coalesces_back_to_maximum() {
        let mut s = fresh(0);
        let stats_before = s.stats();
        let mut addrs = Vec::new();
        for _ in 0..16 {
            addrs.push(s.allocate(0x1000, None).unwrap());
        }
        assert_eq!(
            s.allocate(0x100, None).unwrap_err(),
            BuddyError::NoResources
        );
        // free out of order; eager coalescing must restore the lists
        addrs.reverse();
        addrs.swap(3, 11);
        addrs.swap(0, 7);
        for a in addrs {
            s.free(a).unwrap();
            s.check();
        }
        let stats_after = s.stats();
        for (before, after) in stats_before.shifts.iter().zip(stats_after.shifts.iter()) {
            assert_eq!(before.free_per_color, after.free_per_color);
        }
    }

    #[test]
    fn exact_color_is_honored() {
        let mut s = fresh(2);
        for color in 0..4 {
            let a = s.allocate(0x100, Some(color)).unwrap();
            assert_eq!(s.geo.color_of((a >> 8) as u32, 0), color);
        }
        s.check();
        // colors above the class count are rejected
        assert_eq!(
            s.allocate(0x100, Some(4)).unwrap_err(),
            BuddyError::BadParam
        );
        // at a larger size there are fewer classes
        let a = s.allocate(0x400, Some(0)).unwrap();
        assert_eq!(s.geo.color_of((a >> 8) as u32, 2), 0);
        s.check();
    }

    #[test]
    fn any_color_scans_all_classes_before_splitting() {
        let mut s = fresh(2);
        // the first allocation splits a maximum buffer, leaving one
        // minimum half (of some other color) behind
        let _a = s.allocate(0x100, None).unwrap();
        let min_free: u32 = (0..4)
            .map(|c| s.lists[s.geo.list_index(0, c)].count)
            .sum();
        assert_eq!(min_free, 1);
        let larger_before: u32 = (0..2)
            .map(|c| s.lists[s.geo.list_index(1, c)].count)
            .sum();
        // an unconstrained request must take that half, whatever its
        // color, instead of splitting again
        let _b = s.allocate(0x100, None).unwrap();
        let larger_after: u32 = (0..2)
            .map(|c| s.lists[s.geo.list_index(1, c)].count)
            .sum();
        assert_eq!(larger_after, larger_before);
        let min_free: u32 = (0..4)
            .map(|c| s.lists[s.geo.list_index(0, c)].count)
            .sum();
        assert_eq!(min_free, 0);
        s.check();
    }

    #[test]
    fn allocate_range_walks_free_runs() {
        let mut s = fresh(0);
        let a = s.allocate(0x1000, None).unwrap();
        let b = s.allocate(0x1000, None).unwrap();
        s.free(a).unwrap();

        // ask for the run at b (in use): the scan must advance to a free
        // head instead
        let mut addr = b;
        let mut size = 0u64;
        assert_eq!(
            s.allocate_range(&mut addr, &mut size).unwrap_err(),
            BuddyError::NoResources
        );
        assert_ne!(addr, b);
        // the advanced address names a free run we can take whole
        s.allocate_range(&mut addr, &mut size).unwrap();
        assert!(size >= 0x1000);
        s.check();
    }

    #[test]
    fn allocate_range_takes_exact_heads() {
        let mut s = fresh(0);
        let a = s.allocate(0x400, None).unwrap();
        // keep a's buddy busy so the free below cannot coalesce upward
        let _b = s.allocate(0x400, None).unwrap();
        s.free(a).unwrap();
        let mut addr = a;
        let mut size = 0u64;
        s.allocate_range(&mut addr, &mut size).unwrap();
        assert_eq!(addr, a);
        assert_eq!(size, 0x400);
        s.check();
        assert_eq!(s.free(a).unwrap(), 0x400);
        s.check();
    }

    #[test]
    fn reserved_half_is_never_allocated() {
        // only carve half the range; the rest stays Reserved
        let d = desc(0);
        let geo = Geometry::new(&d, MemspaceKind::Static).unwrap();
        let storage = vec![0u8; geo.create_storage_bytes(d.len) as usize];
        let mut s = SpaceState::new(geo, storage, d.len).unwrap();
        s.carve(AddrRange {
            start: 0,
            len: 0x8000,
        })
        .unwrap();
        s.check();

        // allocations never come out of the reserved half
        let mut seen = Vec::new();
        while let Ok(a) = s.allocate(0x1000, None) {
            assert!(a < 0x8000);
            seen.push(a);
        }
        assert_eq!(seen.len(), 8);
        s.check();
    }
}
