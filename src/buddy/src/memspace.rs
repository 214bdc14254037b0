//! Memspace state: blocks, free lists, status/link array access, carving
//! and hot-add. The allocation algorithms live in `alloc`.

use tracing::debug;

use crate::block::{Arena, Block, BlockArrays};
use crate::layout::{AddrRange, Geometry, MemspaceKind, MAX_DISTINCT_SIZES};
use crate::status::{BufState, Status};
use crate::{BuddyError, Result};

/// Free-list link sentinels. Real buffer numbers stay below 2^31, so the
/// top of the u32 space is free for markers.
pub(crate) const BUF_INVALID: u32 = u32::MAX;
pub(crate) const BUF_HEAD: u32 = u32::MAX - 1;
pub(crate) const BUF_TAIL: u32 = u32::MAX - 2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct FreeList {
    /// First buffer on the list, or `BUF_TAIL` when empty.
    pub first: u32,
    pub count: u32,
}

impl FreeList {
    pub const EMPTY: FreeList = FreeList {
        first: BUF_TAIL,
        count: 0,
    };
}

/// Per-encoding in-use accounting, also the backbone of the statistics
/// dump and the exact-accounting invariant.
#[derive(Debug, Default, Clone)]
pub(crate) struct UseCounts {
    /// In-use power-of-two runs, by relative shift.
    pub pow2_runs: [u64; MAX_DISTINCT_SIZES as usize],
    /// In-use three-buffer runs.
    pub size3_runs: u64,
    /// In-use complex runs and their total length in minimum buffers.
    pub complex_runs: u64,
    pub complex_bufs: u64,
}

impl UseCounts {
    pub fn total_bufs(&self) -> u64 {
        let pow2: u64 = self
            .pow2_runs
            .iter()
            .enumerate()
            .map(|(r, n)| n << r)
            .sum();
        pow2 + 3 * self.size3_runs + self.complex_bufs
    }
}

#[derive(Debug)]
pub(crate) struct SpaceState {
    pub geo: Geometry,
    pub arenas: Vec<Arena>,
    pub blocks: Vec<Block>,
    pub lists: Vec<FreeList>,
    pub used: UseCounts,
    pub reserved_bufs: u64,
    pub realized_bufs: u64,
    /// High-water buffer number (exclusive); advanced by hot-add.
    pub max_buf: u32,
    /// Lowest realized address; hot-add below it is rejected.
    pub min_realized_addr: u64,
}

impl SpaceState {
    pub fn new(geo: Geometry, storage: Vec<u8>, initial_len: u64) -> Result<SpaceState> {
        let need = geo.create_storage_bytes(initial_len);
        if (storage.len() as u64) < need {
            return Err(BuddyError::BadParam);
        }

        let mut arena = Arena::new(storage);
        // charge the block-table overhead before any block arrays
        arena
            .carve(crate::layout::BLOCK_HEADER_BYTES as usize * geo.max_blocks)
            .ok_or(BuddyError::BadParam)?;

        let blocks = match geo.kind {
            MemspaceKind::Static => vec![Block::new(0, geo.block_bufs)],
            MemspaceKind::Dynamic => (0..geo.max_blocks)
                .map(|i| Block::new(i as u32 * geo.block_bufs, geo.block_bufs))
                .collect(),
        };

        let mut state = SpaceState {
            lists: vec![FreeList::EMPTY; geo.total_lists],
            arenas: vec![arena],
            blocks,
            used: UseCounts::default(),
            reserved_bufs: 0,
            realized_bufs: 0,
            max_buf: 0,
            min_realized_addr: u64::MAX,
            geo,
        };

        let initial_blocks = state.geo.blocks_for_len(initial_len);
        for idx in 0..initial_blocks {
            state.realize_block(idx, 0)?;
        }
        Ok(state)
    }

    // === Array access === //

    #[inline]
    pub fn block_index(&self, buf: u32) -> usize {
        debug_assert!(buf < self.max_buf);
        (buf / self.geo.block_bufs) as usize
    }

    fn arrays(&self, buf: u32) -> (BlockArrays, u32) {
        let block = &self.blocks[self.block_index(buf)];
        let arrays = block
            .arrays
            .expect("buffer in unrealized block");
        (arrays, buf - block.base_buf)
    }

    #[inline]
    pub fn status(&self, buf: u32) -> Status {
        Status(self.status_raw(buf))
    }

    pub fn status_raw(&self, buf: u32) -> u8 {
        let (a, off) = self.arrays(buf);
        self.arenas[a.arena].bytes()[a.status_off + off as usize]
    }

    pub fn set_status(&mut self, buf: u32, st: Status) {
        self.set_status_raw(buf, st.0)
    }

    pub fn set_status_raw(&mut self, buf: u32, raw: u8) {
        let (a, off) = self.arrays(buf);
        self.arenas[a.arena].bytes_mut()[a.status_off + off as usize] = raw;
    }

    /// Free-list link cell for `buf`. Cells are shared between buddy
    /// pairs (`buf >> 1`): eager coalescing guarantees at most one of the
    /// two is ever linked.
    pub fn link(&self, buf: u32) -> (u32, u32) {
        let (a, off) = self.arrays(buf);
        let cell = a.links_off + 8 * (off as usize / 2);
        let bytes = self.arenas[a.arena].bytes();
        let prev = u32::from_le_bytes(bytes[cell..cell + 4].try_into().unwrap());
        let next = u32::from_le_bytes(bytes[cell + 4..cell + 8].try_into().unwrap());
        (prev, next)
    }

    pub fn set_link(&mut self, buf: u32, prev: u32, next: u32) {
        let (a, off) = self.arrays(buf);
        let cell = a.links_off + 8 * (off as usize / 2);
        let bytes = self.arenas[a.arena].bytes_mut();
        bytes[cell..cell + 4].copy_from_slice(&prev.to_le_bytes());
        bytes[cell + 4..cell + 8].copy_from_slice(&next.to_le_bytes());
    }

    fn set_link_prev(&mut self, buf: u32, prev: u32) {
        let (_, next) = self.link(buf);
        self.set_link(buf, prev, next);
    }

    fn set_link_next(&mut self, buf: u32, next: u32) {
        let (prev, _) = self.link(buf);
        self.set_link(buf, prev, next);
    }

    // === Free lists === //

    /// LIFO insert at the list head.
    pub fn list_push(&mut self, rel_shift: u32, color: u32, buf: u32) {
        let idx = self.geo.list_index(rel_shift, color);
        let old_first = self.lists[idx].first;
        self.set_link(buf, BUF_HEAD, old_first);
        if old_first != BUF_TAIL {
            self.set_link_prev(old_first, buf);
        }
        self.lists[idx].first = buf;
        self.lists[idx].count += 1;
    }

    pub fn list_pop(&mut self, rel_shift: u32, color: u32) -> Option<u32> {
        let idx = self.geo.list_index(rel_shift, color);
        let first = self.lists[idx].first;
        if first == BUF_TAIL {
            return None;
        }
        self.list_unlink(idx, first);
        Some(first)
    }

    /// Remove `buf` from the `(rel_shift, color)` list it is known to be
    /// on (coalescing removes a buddy from the middle of its list).
    pub fn list_remove(&mut self, rel_shift: u32, color: u32, buf: u32) {
        let idx = self.geo.list_index(rel_shift, color);
        self.list_unlink(idx, buf);
    }

    fn list_unlink(&mut self, idx: usize, buf: u32) {
        let (prev, next) = self.link(buf);
        if prev == BUF_HEAD {
            debug_assert_eq!(self.lists[idx].first, buf);
            self.lists[idx].first = next;
        } else {
            self.set_link_next(prev, next);
        }
        if next != BUF_TAIL {
            self.set_link_prev(next, prev);
        }
        self.set_link(buf, BUF_INVALID, BUF_INVALID);
        self.lists[idx].count -= 1;
    }

    // === Realization and carving === //

    /// Realize arrays for block `idx` from arena `arena_idx`; every
    /// buffer starts out Reserved.
    pub fn realize_block(&mut self, idx: usize, arena_idx: usize) -> Result<()> {
        debug_assert!(!self.blocks[idx].is_realized());
        let num_bufs = self.blocks[idx].num_bufs;
        let status_len = num_bufs as usize;
        let links_len = 8 * num_bufs.div_ceil(2) as usize;

        let arena = &mut self.arenas[arena_idx];
        let status_off = arena.carve(status_len).ok_or(BuddyError::BadParam)?;
        let links_off = arena.carve(links_len).ok_or(BuddyError::BadParam)?;
        self.blocks[idx].arrays = Some(BlockArrays {
            arena: arena_idx,
            status_off,
            links_off,
        });

        let base = self.blocks[idx].base_buf;
        let end = base + num_bufs;
        self.max_buf = self.max_buf.max(end);
        for buf in base..end {
            self.set_status(
                buf,
                Status::new(BufState::Reserved, self.geo.min_shift as u8),
            );
            self.set_link(buf, BUF_INVALID, BUF_INVALID);
        }
        self.reserved_bufs += num_bufs as u64;
        self.realized_bufs += num_bufs as u64;
        self.min_realized_addr = self
            .min_realized_addr
            .min(self.geo.buf_to_addr(base));
        Ok(())
    }

    /// Flip a Reserved sub-range to Free, decomposing it into
    /// power-of-two runs and threading each onto its free list.
    pub fn carve(&mut self, range: AddrRange) -> Result<()> {
        if range.len == 0 || range.len % self.geo.min_buf_size() != 0 {
            return Err(BuddyError::BadParam);
        }
        let first = self.geo.addr_to_buf(range.start)?;
        let nbufs = (range.len >> self.geo.min_shift) as u32;
        let end = first.checked_add(nbufs).ok_or(BuddyError::BadParam)?;
        if end > self.max_buf {
            return Err(BuddyError::BadParam);
        }
        for buf in first..end {
            let idx = self.block_index(buf);
            if !self.blocks[idx].is_realized() {
                return Err(BuddyError::BadParam);
            }
            if self.status(buf).state() != Some(BufState::Reserved) {
                return Err(BuddyError::BadParam);
            }
        }

        let mut pos = first;
        while pos < end {
            let rel = memaddr::largest_aligned_run(
                pos as u64,
                (end - pos) as u64,
                self.geo.rel_max(),
            );
            let run = 1u32 << rel;
            for buf in pos..pos + run {
                self.set_status(buf, Status::INTERIOR);
            }
            self.reserved_bufs -= run as u64;
            self.free_run(pos, rel);
            pos += run;
        }
        debug!(
            name = self.geo.name.as_str(),
            start = range.start,
            len = range.len,
            "carved range"
        );
        Ok(())
    }

    // === Hot-add === //

    pub fn hot_add_sizing(&self, start: u64, len: u64) -> Result<u64> {
        if self.geo.kind != MemspaceKind::Dynamic {
            return Err(BuddyError::BadParam);
        }
        let range = self.geo.blocks_touching(start, len)?;
        let mut bytes = 0u64;
        for idx in range {
            if !self.blocks[idx].is_realized() {
                bytes += self.geo.block_array_bytes(self.blocks[idx].num_bufs);
            }
        }
        Ok(bytes)
    }

    pub fn hot_add(
        &mut self,
        storage: Vec<u8>,
        start: u64,
        len: u64,
        sub_ranges: &[AddrRange],
    ) -> Result<()> {
        if self.geo.kind != MemspaceKind::Dynamic {
            return Err(BuddyError::BadParam);
        }
        if start < self.min_realized_addr {
            return Err(BuddyError::BadParam);
        }
        let need = self.hot_add_sizing(start, len)?;
        if (storage.len() as u64) < need {
            return Err(BuddyError::BadParam);
        }

        let arena_idx = if storage.is_empty() {
            None
        } else {
            self.arenas.push(Arena::new(storage));
            Some(self.arenas.len() - 1)
        };

        let range = self.geo.blocks_touching(start, len)?;
        for idx in range {
            if !self.blocks[idx].is_realized() {
                // need > 0 implies an arena was provided
                let arena = arena_idx.ok_or(BuddyError::BadParam)?;
                self.realize_block(idx, arena)?;
            }
        }
        for sub in sub_ranges {
            self.carve(*sub)?;
        }
        debug!(
            name = self.geo.name.as_str(),
            start,
            len,
            max_buf = self.max_buf,
            "hot-added range"
        );
        Ok(())
    }

    // === Accounting === //

    /// Total free minimum buffers across all lists.
    pub fn free_bufs(&self) -> u64 {
        let mut total = 0u64;
        for r in 0..=self.geo.rel_max() {
            for c in 0..self.geo.colors_at(r) {
                total +=
                    (self.lists[self.geo.list_index(r, c)].count as u64) << r;
            }
        }
        total
    }
}
