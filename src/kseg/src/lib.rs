//! Per-CPU mapping cache ("kseg").
//!
//! Translates machine addresses and (owner, guest-physical) pairs into
//! short-lived kernel-virtual pointers through a small set-associative,
//! lock-free cache backed by dedicated per-CPU page tables. Lookup runs
//! in a non-preemptible section and never takes a lock; remote CPUs
//! invalidate entries with an explicit wait-for-quiescence protocol
//! (see `pair` for the fence discipline that makes the race safe).

mod boundary;
mod cache;
mod pair;
mod table;

pub use boundary::{
    AddressSpace, AspaceError, FrameSource, MachineSpan, TranslateError, TranslateFlags,
};
pub use cache::{Kseg, KsegConfig, MappedRef};
pub use table::{KsegCoreStats, ASSOC};

use thiserror::Error;

/// Failures a map call can surface. Everything else (corrupt metadata,
/// an unreclaimable set in debug builds, a missed flush deadline) is
/// fatal and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum KsegError {
    /// `map_physical(may_block = false)` and the resolver would block.
    #[error("translation would block")]
    WouldBlock,
    /// The owner has no translation for this guest address.
    #[error("no translation")]
    NoTranslation,
    /// The pair was flushed under the lookup more times than the retry
    /// bound allows.
    #[error("lookup retries exhausted")]
    Stale,
    /// Release builds only: no way in the indexed set could be
    /// reclaimed.
    #[error("no reclaimable way")]
    NoResources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum KsegSetupError {
    #[error("frame source out of kernel pages")]
    OutOfKernelPages,
    #[error(transparent)]
    Aspace(#[from] boundary::AspaceError),
}

pub type Result<T> = core::result::Result<T, KsegError>;
