//! Buddy allocator over named machine-address ranges.
//!
//! A [`Buddy`] manages one address range ("memspace") as fixed-size blocks,
//! each block a bit-addressed grid of minimum-sized buffers. It hands out
//! variable-size extents with optional cache-color constraints, shrinks
//! power-of-two allocations back down to the requested size, and grows
//! on line when a dynamic range is hot-added.
//!
//! Metadata lives entirely in caller-supplied storage: a packed status
//! byte per minimum buffer and a halved array of free-list link cells,
//! both addressed by buffer number rather than by pointer. See
//! [`status`] for the byte overlay and [`Buddy::sizing_static`] for the
//! storage contract.

mod alloc;
mod block;
mod check;
mod handle;
mod layout;
mod memspace;
mod registry;
mod stats;
pub mod status;

pub use handle::Buddy;
pub use layout::{AddrRange, MemspaceKind, RangeDesc};
pub use registry::dump_registry;
pub use stats::MemspaceStats;

use thiserror::Error;

/// Error kinds surfaced to allocator callers. All are recoverable by the
/// caller; metadata corruption is not reported here, it panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BuddyError {
    /// Zero or oversize request, invalid color, misaligned or out-of-range
    /// address, hot-add on a static memspace or below the low watermark.
    #[error("bad parameter")]
    BadParam,
    /// No free buffer of the requested (or any larger) size with a
    /// matching color.
    #[error("not enough resources")]
    NoResources,
    /// The memspace is draining or destroyed.
    #[error("memspace is no longer acquirable")]
    Invalid,
}

pub type Result<T> = core::result::Result<T, BuddyError>;

/// Color argument for [`Buddy::allocate`]; `None` disables the constraint.
pub type Color = Option<u32>;
