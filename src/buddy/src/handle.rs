//! The public memspace handle: reference-counted entry around every
//! operation, cooperative destroy, registry hookup.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::*};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use scopeguard::defer;
use tracing::debug;

use crate::layout::{AddrRange, Geometry, MemspaceKind, RangeDesc};
use crate::memspace::SpaceState;
use crate::registry;
use crate::stats::MemspaceStats;
use crate::{BuddyError, Color, Result};

const MEMSPACE_MAGIC: u32 = 0x6d73_7063;

pub(crate) struct Space {
    magic: AtomicU32,
    /// Callers currently inside a public operation.
    refs: AtomicU32,
    draining: AtomicBool,
    drain_lock: Mutex<()>,
    drain_cv: Condvar,
    pub(crate) state: Mutex<SpaceState>,
}

impl Space {
    pub(crate) fn name(&self) -> String {
        self.state.lock().geo.name.clone()
    }
}

/// Handle to one managed address range.
///
/// Handles are cheap to clone and share. Every operation enters the
/// memspace (bumping its reference count) and exits on return; destroy
/// drains those references before tearing the memspace down, after which
/// every clone reports [`BuddyError::Invalid`].
#[derive(Clone)]
pub struct Buddy {
    space: Arc<Space>,
}

impl Buddy {
    /// Exact storage needed to create a static memspace over `desc`.
    pub fn sizing_static(desc: &RangeDesc) -> Result<u64> {
        let geo = Geometry::new(desc, MemspaceKind::Static)?;
        Ok(geo.create_storage_bytes(desc.len))
    }

    /// Exact storage needed to create a dynamic memspace over `desc`.
    /// The block table is sized for the maximum extent; the arrays only
    /// for the initial one (hot-add brings its own array storage).
    pub fn sizing_dynamic(desc: &RangeDesc) -> Result<u64> {
        let geo = Geometry::new(desc, MemspaceKind::Dynamic)?;
        Ok(geo.create_storage_bytes(desc.len))
    }

    pub fn create_static(
        desc: &RangeDesc,
        storage: Vec<u8>,
        sub_ranges: &[AddrRange],
    ) -> Result<Buddy> {
        Self::create(desc, MemspaceKind::Static, storage, sub_ranges)
    }

    pub fn create_dynamic(
        desc: &RangeDesc,
        storage: Vec<u8>,
        sub_ranges: &[AddrRange],
    ) -> Result<Buddy> {
        Self::create(desc, MemspaceKind::Dynamic, storage, sub_ranges)
    }

    fn create(
        desc: &RangeDesc,
        kind: MemspaceKind,
        storage: Vec<u8>,
        sub_ranges: &[AddrRange],
    ) -> Result<Buddy> {
        let geo = Geometry::new(desc, kind)?;
        let mut state = SpaceState::new(geo, storage, desc.len)?;
        for sub in sub_ranges {
            state.carve(*sub)?;
        }
        let space = Arc::new(Space {
            magic: AtomicU32::new(MEMSPACE_MAGIC),
            refs: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            drain_lock: Mutex::new(()),
            drain_cv: Condvar::new(),
            state: Mutex::new(state),
        });
        registry::register(&space);
        debug!(name = desc.name.as_str(), kind = ?kind, "created memspace");
        Ok(Buddy { space })
    }

    /// Allocate `size` bytes, optionally constrained to a cache color.
    /// Returns the extent's starting address.
    pub fn allocate(&self, size: u64, color: Color) -> Result<u64> {
        self.with_state(|s| s.allocate(size, color))
    }

    /// Free the extent starting at `addr`; returns how many bytes the
    /// allocator recovers (the request rounded up to minimum buffers).
    pub fn free(&self, addr: u64) -> Result<u64> {
        self.with_state(|s| s.free(addr))
    }

    /// See [`SpaceState::allocate_range`]: take the free run starting at
    /// `*addr`, or advance `*addr` toward the next free-run head.
    pub fn allocate_range(&self, addr: &mut u64, size: &mut u64) -> Result<()> {
        self.with_state(|s| s.allocate_range(addr, size))
    }

    /// Storage a subsequent [`Buddy::hot_add`] of `[start, start+len)`
    /// needs for blocks that do not have their arrays yet.
    pub fn hot_add_sizing(&self, start: u64, len: u64) -> Result<u64> {
        self.with_state(|s| s.hot_add_sizing(start, len))
    }

    /// Extend a dynamic memspace on line: realize arrays for the
    /// newly-covered blocks and carve `sub_ranges` into them.
    pub fn hot_add(
        &self,
        storage: Vec<u8>,
        start: u64,
        len: u64,
        sub_ranges: &[AddrRange],
    ) -> Result<()> {
        self.with_state(|s| s.hot_add(storage, start, len, sub_ranges))
    }

    /// Snapshot the statistics counters.
    pub fn stats(&self) -> Result<MemspaceStats> {
        self.with_state(|s| Ok(s.stats()))
    }

    /// Visit every live allocation as `(address, length)`, without
    /// mutating allocator state. Crash-dump hook.
    pub fn for_each_allocation(&self, f: impl FnMut(u64, u64)) -> Result<()> {
        self.with_state(|s| {
            s.for_each_allocation(f);
            Ok(())
        })
    }

    /// Run the full invariant self-check (expensive).
    pub fn check(&self) -> Result<()> {
        self.with_state(|s| {
            s.check();
            Ok(())
        })
    }

    /// Mark the memspace non-acquirable, wait for outstanding callers to
    /// drain, then tear it down. Clones of this handle observe
    /// [`BuddyError::Invalid`] afterwards.
    pub fn destroy(self) -> Result<()> {
        let space = &self.space;
        if space.magic.load(Relaxed) != MEMSPACE_MAGIC {
            return Err(BuddyError::Invalid);
        }
        if space.draining.swap(true, AcqRel) {
            // someone else is already tearing this memspace down
            return Err(BuddyError::Invalid);
        }

        let mut guard = space.drain_lock.lock();
        while space.refs.load(Acquire) != 0 {
            space.drain_cv.wait(&mut guard);
        }
        drop(guard);

        space.magic.store(0, Release);
        registry::unregister(space);
        debug!(name = space.name().as_str(), "destroyed memspace");
        Ok(())
    }

    // === Entry gate === //

    fn with_state<T>(&self, f: impl FnOnce(&mut SpaceState) -> Result<T>) -> Result<T> {
        self.enter()?;
        defer! {
            self.exit();
        }
        let mut state = self.space.state.lock();
        f(&mut state)
    }

    fn enter(&self) -> Result<()> {
        let space = &self.space;
        if space.magic.load(Relaxed) != MEMSPACE_MAGIC || space.draining.load(Acquire) {
            return Err(BuddyError::Invalid);
        }
        space.refs.fetch_add(1, AcqRel);
        // destroy may have set the drain flag between the check and the
        // increment; back out rather than racing the teardown
        if space.draining.load(Acquire) {
            self.exit();
            return Err(BuddyError::Invalid);
        }
        Ok(())
    }

    fn exit(&self) {
        let space = &self.space;
        if space.refs.fetch_sub(1, AcqRel) == 1 && space.draining.load(Acquire) {
            let _guard = space.drain_lock.lock();
            space.drain_cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_space() -> Buddy {
        let desc = RangeDesc {
            name: "drain-test".into(),
            start: 0,
            len: 0x10000,
            max_len: 0,
            min_buf_size: 0x100,
            max_buf_size: 0x1000,
            color_bits: 0,
            block_size_hint: 0,
        };
        let storage = vec![0u8; Buddy::sizing_static(&desc).unwrap() as usize];
        Buddy::create_static(
            &desc,
            storage,
            &[AddrRange {
                start: 0,
                len: 0x10000,
            }],
        )
        .unwrap()
    }

    #[test]
    fn clones_share_the_memspace() {
        let a = small_space();
        let b = a.clone();
        let addr = a.allocate(0x100, None).unwrap();
        assert_eq!(b.free(addr).unwrap(), 0x100);
    }

    #[test]
    fn destroy_invalidates_clones() {
        let a = small_space();
        let b = a.clone();
        a.destroy().unwrap();
        assert_eq!(b.allocate(0x100, None).unwrap_err(), BuddyError::Invalid);
        assert_eq!(b.destroy().unwrap_err(), BuddyError::Invalid);
    }

    #[test]
    fn destroy_waits_for_active_callers() {
        let a = small_space();
        let b = a.clone();

        // hold the memspace entered on another thread, then destroy
        let entered = std::sync::Barrier::new(2);
        std::thread::scope(|s| {
            s.spawn(|| {
                b.enter().unwrap();
                entered.wait();
                std::thread::sleep(std::time::Duration::from_millis(50));
                b.exit();
            });
            entered.wait();
            let t0 = std::time::Instant::now();
            a.destroy().unwrap();
            assert!(t0.elapsed() >= std::time::Duration::from_millis(40));
        });
    }
}
