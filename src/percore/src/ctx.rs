use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;

/// Index of a logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub usize);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Proof of pinned, cooperative execution on one core.
///
/// Holding a `CoreCtx` means the current thread is the sole mutator of
/// that core's CPU-local state until it yields. The type is `!Send`; a
/// context can never be observed from another thread, which is exactly
/// the guarantee the lock-free lookup needs from the dispatcher.
pub struct CoreCtx {
    id: CoreId,
    irqs_enabled: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for CoreCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreCtx")
            .field("id", &self.id)
            .field("irqs_enabled", &self.irqs_enabled.get())
            .finish()
    }
}

impl CoreCtx {
    /// Callers go through [`crate::CoreSet::attach`]; this is for glue
    /// that owns its own core accounting.
    pub(crate) fn new(id: CoreId) -> Self {
        Self {
            id,
            irqs_enabled: Cell::new(true),
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn id(&self) -> CoreId {
        self.id
    }

    #[inline]
    pub fn irqs_enabled(&self) -> bool {
        self.irqs_enabled.get()
    }

    /// Save and disable the (emulated) interrupt flag. The returned guard
    /// restores the saved state on drop, so nested sections compose.
    #[inline]
    pub fn disable_irqs(&self) -> IrqGuard<'_> {
        let saved = self.irqs_enabled.replace(false);
        IrqGuard { ctx: self, saved }
    }

    /// Entry points that must not touch the flag assert it instead.
    #[inline]
    #[track_caller]
    pub fn assert_irqs_disabled(&self) {
        assert!(
            !self.irqs_enabled.get(),
            "{}: interrupts unexpectedly enabled",
            self.id
        );
    }
}

/// Restores the saved interrupt flag when dropped.
pub struct IrqGuard<'a> {
    ctx: &'a CoreCtx,
    saved: bool,
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.ctx.irqs_enabled.set(self.saved);
    }
}
