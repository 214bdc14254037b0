//! Invariant self-check. Expensive (full metadata walk); meant for tests
//! and debug diagnostics, never the hot path.

use std::collections::HashSet;

use crate::memspace::{SpaceState, BUF_HEAD, BUF_TAIL};
use crate::status::{BufState, SHIFT_COMPLEX, SHIFT_SIZE3};

impl SpaceState {
    /// Validate the universal invariants:
    ///
    /// * list cells are Free heads of their list's shift and color, with a
    ///   well-formed doubly-linked chain and accurate count;
    /// * every Free head is aligned to its size and never has an
    ///   entirely-free buddy at the same size (eager coalesce);
    /// * free + in-use + reserved buffers account for every realized
    ///   buffer exactly.
    pub fn check(&self) {
        let mut on_lists: HashSet<u32> = HashSet::new();

        for r in 0..=self.geo.rel_max() {
            let abs_shift = (self.geo.min_shift + r) as u8;
            for c in 0..self.geo.colors_at(r) {
                let list = &self.lists[self.geo.list_index(r, c)];
                let mut walked = 0u32;
                let mut prev = BUF_HEAD;
                let mut cur = list.first;
                while cur != BUF_TAIL {
                    let st = self.status(cur);
                    assert!(
                        st.is_free_head(abs_shift),
                        "list ({r},{c}): buffer {cur} has status {:#04x}",
                        st.0
                    );
                    assert_eq!(
                        self.geo.color_of(cur, r),
                        c,
                        "list ({r},{c}): buffer {cur} has the wrong color"
                    );
                    let (cell_prev, cell_next) = self.link(cur);
                    assert_eq!(cell_prev, prev, "list ({r},{c}): bad back link at {cur}");
                    assert!(on_lists.insert(cur), "buffer {cur} linked twice");
                    prev = cur;
                    cur = cell_next;
                    walked += 1;
                    assert!(walked <= list.count, "list ({r},{c}) longer than its count");
                }
                assert_eq!(walked, list.count, "list ({r},{c}) count mismatch");
            }
        }

        // full status walk: re-derive the counters and the buddy rule
        let mut free_bufs = 0u64;
        let mut reserved = 0u64;
        let mut realized = 0u64;
        let mut pow2 = [0u64; crate::layout::MAX_DISTINCT_SIZES as usize];
        let mut size3 = 0u64;
        let mut complex_runs = 0u64;
        let mut complex_bufs = 0u64;

        for block in &self.blocks {
            if !block.is_realized() {
                continue;
            }
            realized += block.num_bufs as u64;
            let mut buf = block.base_buf;
            let end = block.base_buf + block.num_bufs;
            while buf < end {
                let st = self.status(buf);
                let advance = match st.state() {
                    Some(BufState::Reserved) => {
                        reserved += 1;
                        1
                    }
                    Some(BufState::Free) => {
                        let rel = st.shift() as u32 - self.geo.min_shift;
                        assert!(buf & ((1 << rel) - 1) == 0, "misaligned free head {buf}");
                        assert!(on_lists.contains(&buf), "free head {buf} not on any list");
                        if rel < self.geo.rel_max() {
                            let buddy = buf ^ (1u32 << rel);
                            if buddy < self.max_buf {
                                assert!(
                                    !self.status(buddy).is_free_head(st.shift()),
                                    "free buddies {buf}/{buddy} left uncoalesced at rel {rel}"
                                );
                            }
                        }
                        free_bufs += 1 << rel;
                        1 << rel
                    }
                    Some(BufState::InUse) => match st.shift() {
                        SHIFT_SIZE3 => {
                            size3 += 1;
                            3
                        }
                        SHIFT_COMPLEX => {
                            let n = u32::from_le_bytes([
                                self.status_raw(buf + 1),
                                self.status_raw(buf + 2),
                                self.status_raw(buf + 3),
                                0,
                            ]);
                            assert!(n > 4, "complex run at {buf} with length {n}");
                            complex_runs += 1;
                            complex_bufs += n as u64;
                            n
                        }
                        shift => {
                            let rel = shift as u32 - self.geo.min_shift;
                            assert!(
                                buf & ((1 << rel) - 1) == 0,
                                "misaligned in-use head {buf}"
                            );
                            pow2[rel as usize] += 1;
                            1 << rel
                        }
                    },
                    None => panic!("interior marker at run boundary {buf}"),
                };
                buf += advance;
            }
            assert_eq!(buf, end, "run walk overran block end");
        }

        assert_eq!(free_bufs, self.free_bufs(), "free counter drift");
        assert_eq!(reserved, self.reserved_bufs, "reserved counter drift");
        assert_eq!(realized, self.realized_bufs, "realized counter drift");
        assert_eq!(pow2, self.used.pow2_runs, "pow2 run counter drift");
        assert_eq!(size3, self.used.size3_runs, "size3 run counter drift");
        assert_eq!(complex_runs, self.used.complex_runs, "complex run counter drift");
        assert_eq!(complex_bufs, self.used.complex_bufs, "complex length drift");

        // exact accounting over the managed extent
        assert_eq!(
            free_bufs + self.used.total_bufs() + reserved,
            realized,
            "free + in-use + reserved must cover the managed extent"
        );
    }
}
