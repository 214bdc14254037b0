//! The cache proper: lock-free lookup, LRU insertion, lazy second-page
//! installs, and remote invalidation with quiescence waits.

use core::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memaddr::{
    GuestPhysAddr, MachineAddr, Mpn, OwnerId, Ppn, VirtAddr, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE,
};
use percore::{CoreCtx, CoreId, PerCore};
use tracing::{debug, error};

use crate::boundary::{AddressSpace, FrameSource, TranslateError, TranslateFlags};
use crate::pair::{pack_tag, tag_owner, tag_page, Pair, TAG_INVALID};
use crate::table::{CpuTable, KsegCoreStats, ASSOC};
use crate::{KsegError, KsegSetupError, Result};

/// Bounded restarts of the increment-recheck protocol before the lookup
/// reports `Stale`.
const MAX_RETRIES: u32 = 8;

const PTES_PER_PAGE: usize = PAGE_SIZE as usize / 8;

#[derive(Debug, Clone)]
pub struct KsegConfig {
    pub num_cores: usize,
    /// Sets per CPU; a set holds [`ASSOC`] pairs.
    pub num_sets: usize,
    /// Hard bound on remote quiescence waits; expiry is fatal.
    pub flush_deadline: Duration,
}

impl Default for KsegConfig {
    fn default() -> Self {
        KsegConfig {
            num_cores: 1,
            num_sets: 64,
            flush_deadline: Duration::from_secs(2),
        }
    }
}

/// What a map request is keyed by.
#[derive(Debug, Clone, Copy)]
enum Target {
    Machine,
    Guest {
        owner: OwnerId,
        flags: TranslateFlags,
        may_block: bool,
    },
}

impl Target {
    fn owner(&self) -> OwnerId {
        match self {
            Target::Machine => OwnerId::NONE,
            Target::Guest { owner, .. } => *owner,
        }
    }
}

/// The per-CPU mapping cache.
pub struct Kseg {
    frames: Arc<dyn FrameSource>,
    aspace: Arc<dyn AddressSpace>,
    tables: PerCore<CpuTable>,
    flush_deadline: Duration,
}

impl Kseg {
    /// Bootstrap: allocate the dedicated per-CPU page-table pages from
    /// the frame source and attach each CPU's virtual window.
    pub fn new(
        config: KsegConfig,
        frames: Arc<dyn FrameSource>,
        aspace: Arc<dyn AddressSpace>,
    ) -> core::result::Result<Kseg, KsegSetupError> {
        assert!(config.num_cores > 0 && config.num_sets > 0);
        let window_pages = config.num_sets * ASSOC * 2;
        let pt_pages = window_pages.div_ceil(PTES_PER_PAGE).max(1);

        let mut bases = Vec::with_capacity(config.num_cores);
        for core in 0..config.num_cores {
            let pages = (0..pt_pages)
                .map(|_| frames.alloc_kernel_page())
                .collect::<Option<Vec<Mpn>>>()
                .ok_or(KsegSetupError::OutOfKernelPages)?;
            let base = aspace.attach_cpu(CoreId(core), window_pages, &pages)?;
            bases.push(base);
        }

        debug!(
            cores = config.num_cores,
            sets = config.num_sets,
            window_pages,
            "kseg attached"
        );
        Ok(Kseg {
            frames,
            aspace,
            tables: PerCore::new(config.num_cores, |id| {
                CpuTable::new(bases[id.0], config.num_sets)
            }),
            flush_deadline: config.flush_deadline,
        })
    }

    // === Map entry points === //

    /// Map `length` bytes at `maddr` (at most two pages' worth) into this
    /// CPU's window. Saves and disables interrupts for the critical
    /// section; the caller must already be non-preemptible.
    pub fn map_machine<'a>(
        &'a self,
        ctx: &'a CoreCtx,
        maddr: MachineAddr,
        length: u64,
    ) -> Result<MappedRef<'a>> {
        let _irq = ctx.disable_irqs();
        self.map_locked(ctx, Target::Machine, maddr.0, length)
    }

    /// As [`Kseg::map_machine`] for paths that must not touch the
    /// interrupt flag; asserts it is already clear.
    pub fn map_machine_irqs_off<'a>(
        &'a self,
        ctx: &'a CoreCtx,
        maddr: MachineAddr,
        length: u64,
    ) -> Result<MappedRef<'a>> {
        ctx.assert_irqs_disabled();
        self.map_locked(ctx, Target::Machine, maddr.0, length)
    }

    /// Map through `owner`'s guest-physical space. With `may_block` the
    /// PA→MA resolver may suspend; without it an unresolved translation
    /// returns [`KsegError::WouldBlock`] and installs nothing.
    pub fn map_physical<'a>(
        &'a self,
        ctx: &'a CoreCtx,
        owner: OwnerId,
        paddr: GuestPhysAddr,
        length: u64,
        may_block: bool,
    ) -> Result<MappedRef<'a>> {
        let _irq = ctx.disable_irqs();
        let target = Target::Guest {
            owner,
            flags: TranslateFlags::WRITE,
            may_block,
        };
        self.map_locked(ctx, target, paddr.0, length)
    }

    // === Invalidation === //

    /// Drop local mappings overlapping `(owner, ppn)`, including a
    /// two-page pair that starts at `ppn - 1`. The caller owns the
    /// upstream lock that keeps new mappings from appearing.
    pub fn invalidate(&self, ctx: &CoreCtx, owner: OwnerId, ppn: Ppn) {
        let _irq = ctx.disable_irqs();
        let table = self.tables.get(ctx.id());
        for page in Self::overlapping_pages(ppn) {
            let tag = pack_tag(owner, page);
            let set = table.set_for(page);
            for w in 0..ASSOC {
                let way = set.way(w);
                if way.tag() != tag {
                    continue;
                }
                // a pair at ppn-1 only overlaps if it spans two pages
                if page != ppn.0 && way.max_addr() <= ppn.addr().0 {
                    continue;
                }
                debug_assert_eq!(way.refs(), 0, "invalidating a held local pair");
                way.invalidate();
            }
        }
    }

    /// On every other CPU, invalidate any pair matching `(owner, ppn)`
    /// or `(owner, ppn-1)` (or already invalid, to cover in-flight
    /// inserts) and spin until its reference count drains. The wait is
    /// bounded by the configured deadline; exceeding it is fatal.
    pub fn flush_remote(&self, ctx: &CoreCtx, owner: OwnerId, ppn: Ppn) {
        let deadline = Instant::now() + self.flush_deadline;
        for (core, table) in self.tables.iter_remote(ctx.id()) {
            for page in Self::overlapping_pages(ppn) {
                let tag = pack_tag(owner, page);
                let set = table.set_for(page);
                for w in 0..ASSOC {
                    let way = set.way(w);
                    let cur = way.tag();
                    if cur != tag && cur != TAG_INVALID {
                        continue;
                    }
                    way.invalidate();
                    while way.refs() != 0 {
                        assert!(
                            Instant::now() <= deadline,
                            "kseg flush deadline exceeded on {core} for {owner:?} {ppn:?}"
                        );
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }

    /// Non-blocking [`Kseg::flush_remote`]: invalidates what is
    /// quiescent and reports whether any remote reference is still live.
    pub fn check_remote(&self, ctx: &CoreCtx, owner: OwnerId, ppn: Ppn) -> bool {
        let mut busy = false;
        for (_core, table) in self.tables.iter_remote(ctx.id()) {
            for page in Self::overlapping_pages(ppn) {
                let tag = pack_tag(owner, page);
                let set = table.set_for(page);
                for w in 0..ASSOC {
                    let way = set.way(w);
                    let cur = way.tag();
                    if cur != tag && cur != TAG_INVALID {
                        continue;
                    }
                    way.invalidate();
                    if way.refs() != 0 {
                        busy = true;
                    }
                }
            }
        }
        busy
    }

    /// Drop every local pair whose reference count is zero.
    pub fn flush_local(&self, ctx: &CoreCtx) {
        let _irq = ctx.disable_irqs();
        let table = self.tables.get(ctx.id());
        for (_idx, set) in table.sets() {
            for w in 0..ASSOC {
                let way = set.way(w);
                if way.refs() == 0 {
                    way.invalidate();
                }
            }
        }
    }

    // === Diagnostics === //

    /// Write every live pair, without mutating cache state. Crash-dump
    /// hook.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for (core, table) in self.tables.iter() {
            for (set_idx, set) in table.sets() {
                for w in 0..ASSOC {
                    let way = set.way(w);
                    let tag = way.tag();
                    if tag == TAG_INVALID {
                        continue;
                    }
                    writeln!(
                        out,
                        "{core} set {set_idx} way {w}: owner {:#x} page {:#x} max {:#x} refs {}",
                        tag_owner(tag).0,
                        tag_page(tag),
                        way.max_addr(),
                        way.refs()
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Per-CPU try/hit counters, indexed by core.
    pub fn stats(&self) -> Vec<KsegCoreStats> {
        self.tables
            .iter()
            .map(|(_, table)| table.stats.snapshot())
            .collect()
    }

    /// The statistics "reset" command: zero every CPU's counters.
    pub fn reset_stats(&self) {
        for (_, table) in self.tables.iter() {
            table.stats.reset();
        }
    }

    // === Lookup === //

    fn map_locked<'a>(
        &'a self,
        ctx: &'a CoreCtx,
        target: Target,
        addr: u64,
        length: u64,
    ) -> Result<MappedRef<'a>> {
        assert!(
            length > 0 && length <= 2 * PAGE_SIZE,
            "kseg map length {length:#x} out of range"
        );
        let page = addr >> PAGE_SHIFT;
        let offset = addr & PAGE_MASK;
        assert!(
            offset + length <= 2 * PAGE_SIZE,
            "kseg extent {addr:#x}+{length:#x} spans more than two pages"
        );
        let want_max = addr + length;
        let tag = pack_tag(target.owner(), page);

        let table = self.tables.get(ctx.id());
        let set = table.set_for(page);
        table.stats.tries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        for _attempt in 0..MAX_RETRIES {
            // 1. single-probe fast path through the last-way hint
            let hint = set.last_way();
            let way = set.way(hint);
            if way.tag() == tag && way.max_addr() >= want_max {
                if way.acquire(tag) {
                    table
                        .stats
                        .hits_first_way
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Ok(self.finish_map(ctx, table, way, offset, length));
                }
                continue; // flushed under us; restart
            }

            // 2. full set scan
            let mut matched = false;
            for w in 0..ASSOC {
                let way = set.way(w);
                if way.tag() != tag {
                    continue;
                }
                matched = true;
                if way.max_addr() < want_max {
                    // the extent grew past the first page: bind the
                    // second virtual page now
                    self.install_second(ctx, way, target, page)?;
                }
                if way.acquire(tag) {
                    if way.max_addr() < want_max {
                        // a flush raced the extend; try again
                        way.release();
                        break;
                    }
                    set.note_hit(w);
                    table
                        .stats
                        .hits_other_way
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Ok(self.finish_map(ctx, table, way, offset, length));
                }
                break;
            }
            if matched {
                continue;
            }

            // 3. miss: resolve every translation before touching a way,
            // so a failed resolve leaves no partial state behind
            let needs_second = offset + length > PAGE_SIZE;
            let (mpn0, mpn1) = self.resolve(target, page, needs_second)?;

            let Some(w) = set.take_victim() else {
                if cfg!(debug_assertions) {
                    panic!("kseg set for page {page:#x} has every way referenced");
                }
                error!(core = %ctx.id(), page, "kseg set exhausted");
                return Err(KsegError::NoResources);
            };
            let way = set.way(w);
            way.invalidate();

            self.aspace.install_pte(ctx.id(), way.vaddr().vpn(), mpn0);
            let mut new_max = (page + 1) << PAGE_SHIFT;
            if let Some(m1) = mpn1 {
                self.aspace.install_pte(ctx.id(), way.second_page().vpn(), m1);
                new_max += PAGE_SIZE;
            }
            way.install(tag, new_max);

            if way.acquire(tag) {
                if way.max_addr() >= want_max {
                    set.note_hit(w);
                    return Ok(self.finish_map(ctx, table, way, offset, length));
                }
                way.release();
            }
            // a concurrent flush invalidated the pair between install
            // and increment; restart the lookup
        }

        error!(core = %ctx.id(), page, "kseg lookup retries exhausted");
        Err(KsegError::Stale)
    }

    fn finish_map<'a>(
        &'a self,
        ctx: &'a CoreCtx,
        table: &'a CpuTable,
        pair: &'a Pair,
        offset: u64,
        length: u64,
    ) -> MappedRef<'a> {
        table.live_inc();
        MappedRef {
            ctx,
            table,
            pair,
            va: pair.vaddr().add(offset as usize),
            length,
        }
    }

    /// Bind the pair's second virtual page; machine extents are
    /// contiguous, guest extents fetch the second MPN separately.
    fn install_second(&self, ctx: &CoreCtx, way: &Pair, target: Target, page: u64) -> Result<()> {
        let mpn1 = self.resolve_one(target, page + 1)?;
        self.aspace.install_pte(ctx.id(), way.second_page().vpn(), mpn1);
        way.extend((page + 2) << PAGE_SHIFT);
        Ok(())
    }

    fn resolve(
        &self,
        target: Target,
        page: u64,
        needs_second: bool,
    ) -> Result<(Mpn, Option<Mpn>)> {
        let mpn0 = self.resolve_one(target, page)?;
        let mpn1 = if needs_second {
            Some(self.resolve_one(target, page + 1)?)
        } else {
            None
        };
        Ok((mpn0, mpn1))
    }

    fn resolve_one(&self, target: Target, page: u64) -> Result<Mpn> {
        match target {
            Target::Machine => Ok(Mpn(page)),
            Target::Guest {
                owner,
                flags,
                may_block,
            } => {
                let span = self
                    .frames
                    .phys_to_machine(owner, Ppn(page).addr(), PAGE_SIZE, flags, may_block)
                    .map_err(|e| match e {
                        TranslateError::WouldBlock => KsegError::WouldBlock,
                        TranslateError::NoTranslation => KsegError::NoTranslation,
                    })?;
                debug_assert!(span.len >= PAGE_SIZE);
                Ok(span.addr.mpn())
            }
        }
    }

    /// The pages a `(owner, ppn)` invalidation must consider: the page
    /// itself and a two-page span starting one page below.
    fn overlapping_pages(ppn: Ppn) -> impl Iterator<Item = u64> {
        std::iter::once(ppn.0).chain(ppn.prev().map(|p| p.0))
    }
}

/// A held mapping: the exact virtual window over the requested extent,
/// pinned until release (explicit or on drop).
pub struct MappedRef<'a> {
    ctx: &'a CoreCtx,
    table: &'a CpuTable,
    pair: &'a Pair,
    va: VirtAddr,
    length: u64,
}

impl MappedRef<'_> {
    #[inline]
    pub fn va(&self) -> VirtAddr {
        self.va
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.va.as_ptr()
    }

    /// Drop the reference. Equivalent to letting the guard fall out of
    /// scope; the name matches what callers are doing.
    pub fn release(self) {}
}

impl Drop for MappedRef<'_> {
    fn drop(&mut self) {
        let _irq = self.ctx.disable_irqs();
        self.pair.release();
        self.table.live_dec();
    }
}

impl fmt::Debug for MappedRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRef")
            .field("va", &self.va)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
