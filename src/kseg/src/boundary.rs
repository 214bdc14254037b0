//! Boundary traits: what the mapping cache consumes from the frame
//! source and from the address-space glue. The cache declares its
//! requirements here and nothing else about either collaborator.

use bitflags::bitflags;
use memaddr::{GuestPhysAddr, MachineAddr, Mpn, OwnerId, VirtAddr, Vpn};
use percore::CoreId;
use thiserror::Error;

bitflags! {
    /// Access intent forwarded to the PA→MA resolver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TranslateFlags: u32 {
        const WRITE = 1 << 0;
    }
}

/// A translated machine extent. `len` may be shorter than requested when
/// the guest-contiguous range is machine-discontiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSpan {
    pub addr: MachineAddr,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TranslateError {
    /// The translation exists but resolving it would block.
    #[error("translation would block")]
    WouldBlock,
    /// No translation for this guest address.
    #[error("no translation")]
    NoTranslation,
}

/// Supplier of machine pages and guest-physical translations.
pub trait FrameSource: Send + Sync {
    /// A fresh kernel-owned machine page, or `None` when exhausted. Used
    /// only at cache bootstrap for the dedicated per-CPU table pages.
    fn alloc_kernel_page(&self) -> Option<Mpn>;

    /// Translate `[pa, pa+len)` in `owner`'s space. With `may_block`
    /// false the resolver must return [`TranslateError::WouldBlock`]
    /// instead of suspending.
    fn phys_to_machine(
        &self,
        owner: OwnerId,
        pa: GuestPhysAddr,
        len: u64,
        flags: TranslateFlags,
        may_block: bool,
    ) -> Result<MachineSpan, TranslateError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AspaceError {
    #[error("no kernel-virtual window available for {0}")]
    NoWindow(CoreId),
}

/// Per-CPU kernel page-table glue.
///
/// The cache owns which (vpn → mpn) bindings exist inside its window;
/// the glue owns how they become page-table entries and how the local
/// TLB learns about them.
pub trait AddressSpace: Send + Sync {
    /// Reserve the per-CPU window of `num_pages` kernel-virtual pages
    /// and wire in the caller-provided page-table pages. Returns the
    /// window base, page-aligned and stable for the process lifetime.
    fn attach_cpu(
        &self,
        core: CoreId,
        num_pages: usize,
        pt_pages: &[Mpn],
    ) -> Result<VirtAddr, AspaceError>;

    /// Write a kernel-readable, writable PTE for `vpn` on `core`'s
    /// tables and invalidate the local TLB entry. Only ever called by
    /// `core` itself, inside a non-preemptible section.
    fn install_pte(&self, core: CoreId, vpn: Vpn, mpn: Mpn);
}
