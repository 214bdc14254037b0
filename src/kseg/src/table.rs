//! Per-CPU tables: sets of ways, hit statistics, the debug ceiling on
//! simultaneously-held mappings.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::*};

use memaddr::{VirtAddr, PAGE_SIZE};

use crate::pair::Pair;

/// Ways per set.
pub const ASSOC: usize = 4;

pub(crate) struct Set {
    ways: [Pair; ASSOC],
    /// Rotating victim pointer; insertion may advance it at most
    /// [`ASSOC`] times looking for an unreferenced way.
    lru: AtomicU32,
    /// Single-probe fast path: the way that hit most recently.
    last_way: AtomicU32,
}

impl Set {
    fn new(first_vaddr: VirtAddr) -> Set {
        let ways = core::array::from_fn(|w| {
            Pair::new(first_vaddr.add(w * 2 * PAGE_SIZE as usize))
        });
        Set {
            ways,
            lru: AtomicU32::new(0),
            last_way: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn way(&self, idx: usize) -> &Pair {
        &self.ways[idx]
    }

    #[inline]
    pub fn last_way(&self) -> usize {
        self.last_way.load(Relaxed) as usize % ASSOC
    }

    /// Record a hit: the way becomes the fast-path probe and the victim
    /// search resumes past it.
    pub fn note_hit(&self, idx: usize) {
        self.last_way.store(idx as u32, Relaxed);
        self.lru.store(idx as u32 + 1, Relaxed);
    }

    /// Rotate the victim pointer to an unreferenced way. `None` when the
    /// whole set is pinned.
    pub fn take_victim(&self) -> Option<usize> {
        let mut lru = self.lru.load(Relaxed);
        for _ in 0..ASSOC {
            let idx = lru as usize % ASSOC;
            lru = lru.wrapping_add(1);
            if self.ways[idx].refs() == 0 {
                self.lru.store(lru, Relaxed);
                return Some(idx);
            }
        }
        None
    }
}

/// Per-CPU try/hit counters. Relaxed: they are diagnostics, not
/// synchronization.
#[derive(Default)]
pub(crate) struct CpuStats {
    pub tries: AtomicU64,
    pub hits_first_way: AtomicU64,
    pub hits_other_way: AtomicU64,
}

/// Read-only statistics snapshot for one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KsegCoreStats {
    pub tries: u64,
    pub hits_first_way: u64,
    pub hits_other_way: u64,
}

impl CpuStats {
    pub fn snapshot(&self) -> KsegCoreStats {
        KsegCoreStats {
            tries: self.tries.load(Relaxed),
            hits_first_way: self.hits_first_way.load(Relaxed),
            hits_other_way: self.hits_other_way.load(Relaxed),
        }
    }

    pub fn reset(&self) {
        self.tries.store(0, Relaxed);
        self.hits_first_way.store(0, Relaxed);
        self.hits_other_way.store(0, Relaxed);
    }
}

pub(crate) struct CpuTable {
    sets: Box<[Set]>,
    pub stats: CpuStats,
    /// Mappings currently held on this CPU; exceeding [`ASSOC`] could
    /// pin an entire set and deadlock insertion, so debug builds treat
    /// it as fatal.
    live: AtomicU32,
}

impl CpuTable {
    pub fn new(window_base: VirtAddr, num_sets: usize) -> CpuTable {
        let sets = (0..num_sets)
            .map(|s| Set::new(window_base.add(s * ASSOC * 2 * PAGE_SIZE as usize)))
            .collect();
        CpuTable {
            sets,
            stats: CpuStats::default(),
            live: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn set_for(&self, page: u64) -> &Set {
        &self.sets[(page % self.sets.len() as u64) as usize]
    }

    pub fn sets(&self) -> impl Iterator<Item = (usize, &Set)> {
        self.sets.iter().enumerate()
    }

    #[track_caller]
    pub fn live_inc(&self) {
        let live = self.live.fetch_add(1, Relaxed) + 1;
        if cfg!(debug_assertions) && live as usize > ASSOC {
            panic!("{live} kseg mappings held at once on one cpu");
        }
    }

    pub fn live_dec(&self) {
        let prev = self.live.fetch_sub(1, Relaxed);
        debug_assert!(prev > 0);
    }
}
