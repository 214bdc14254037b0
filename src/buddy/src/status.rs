//! The packed per-buffer status byte.
//!
//! One byte per minimum buffer: `state:2 | shift:6`, state in the high
//! two bits. Only the head buffer of a run carries a meaningful shift;
//! every other byte of the run holds [`Status::INTERIOR`] (the all-ones
//! byte).
//!
//! Three shift values are sentinels rather than sizes:
//!
//! * [`SHIFT_SIZE3`]: the in-use run is exactly three minimum buffers.
//! * [`SHIFT_COMPLEX`]: the in-use run length does not fit a sentinel:
//!   the **three status bytes after the head** are repurposed as a
//!   little-endian 24-bit run length in minimum buffers. Those bytes are
//!   raw length data, not status bytes, until the run is freed and they
//!   are reset to `INTERIOR`. Debug builds verify that only the head of a
//!   run is ever consulted for size.
//! * [`SHIFT_INVALID`]: not a head.
//!
//! Real shifts are absolute (`log2` of the run's byte size) and must stay
//! below the sentinel space, which caps buffer sizes at 2^60 bytes.

pub(crate) const STATE_SHIFT: u32 = 6;
pub(crate) const SHIFT_MASK: u8 = (1 << STATE_SHIFT) - 1;

pub const SHIFT_INVALID: u8 = 0x3f;
pub const SHIFT_SIZE3: u8 = 0x3e;
pub const SHIFT_COMPLEX: u8 = 0x3d;

/// Largest encodable real shift.
pub const SHIFT_MAX_REAL: u8 = 0x3c;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufState {
    Reserved,
    Free,
    InUse,
}

impl BufState {
    #[inline]
    fn bits(self) -> u8 {
        match self {
            BufState::Reserved => 0,
            BufState::Free => 1,
            BufState::InUse => 2,
        }
    }
}

/// One status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u8);

impl Status {
    /// Non-head marker: state bits `0b11`, shift [`SHIFT_INVALID`].
    pub const INTERIOR: Status = Status(0xff);

    #[inline]
    pub fn new(state: BufState, shift: u8) -> Status {
        debug_assert!(shift <= SHIFT_INVALID);
        Status((state.bits() << STATE_SHIFT) | shift)
    }

    /// `None` for the interior marker.
    #[inline]
    pub fn state(self) -> Option<BufState> {
        match self.0 >> STATE_SHIFT {
            0 => Some(BufState::Reserved),
            1 => Some(BufState::Free),
            2 => Some(BufState::InUse),
            _ => None,
        }
    }

    #[inline]
    pub fn shift(self) -> u8 {
        self.0 & SHIFT_MASK
    }

    #[inline]
    pub fn is_interior(self) -> bool {
        self.state().is_none()
    }

    #[inline]
    pub fn is_free_head(self, abs_shift: u8) -> bool {
        self.state() == Some(BufState::Free) && self.shift() == abs_shift
    }
}
