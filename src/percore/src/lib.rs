//! Per-CPU execution plumbing.
//!
//! The mapping cache relies on a cooperative scheduling model: a caller is
//! pinned to one CPU and runs non-preemptible sections between explicit
//! yield points. In-kernel that comes from the dispatcher; here it is
//! reified as a [`CoreCtx`] token that callers must present to every
//! CPU-local entry point. The token is `!Send`, so the type system keeps a
//! "CPU" from migrating mid-section, and it carries the emulated
//! interrupt flag that the map/release paths save and restore.

mod ctx;
mod set;

pub use ctx::{CoreCtx, CoreId, IrqGuard};
pub use set::{CoreAttachError, CoreSet};

/// Fixed array of `T`, one slot per core.
///
/// Slots for remote cores are reachable (remote invalidation walks them),
/// so `T` carries its own synchronization; `PerCore` itself is just the
/// indexed storage.
#[derive(Debug)]
pub struct PerCore<T> {
    slots: Box<[T]>,
}

impl<T> PerCore<T> {
    pub fn new(num_cores: usize, mut init: impl FnMut(CoreId) -> T) -> Self {
        let slots = (0..num_cores).map(|i| init(CoreId(i))).collect();
        Self { slots }
    }

    #[inline]
    pub fn get(&self, core: CoreId) -> &T {
        &self.slots[core.0]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CoreId, &T)> {
        self.slots.iter().enumerate().map(|(i, t)| (CoreId(i), t))
    }

    /// All slots except `skip`, the walk remote invalidation makes.
    pub fn iter_remote(&self, skip: CoreId) -> impl Iterator<Item = (CoreId, &T)> {
        self.iter().filter(move |(id, _)| *id != skip)
    }
}
