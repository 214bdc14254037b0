pub mod addr;
pub mod align;
mod bits;

pub use addr::{GuestPhysAddr, MachineAddr, Mpn, OwnerId, Ppn, VirtAddr, Vpn};
pub use align::{align_down, align_up, is_aligned, largest_aligned_run, log2_u64};

/// Base page shift shared by machine, guest and kernel-virtual spaces.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;
