//! Read-only statistics snapshots, the crash-dump walk over live
//! allocations, and their text rendering.

use core::fmt;

use crate::layout::MemspaceKind;
use crate::memspace::SpaceState;
use crate::status::{BufState, SHIFT_COMPLEX, SHIFT_SIZE3};

/// Free-list population for one size-shift.
#[derive(Debug, Clone)]
pub struct ShiftStats {
    /// Absolute size-shift (log2 of the run byte size).
    pub shift: u32,
    /// Free run count per color class.
    pub free_per_color: Vec<u32>,
    /// In-use power-of-two runs of this size.
    pub used_runs: u64,
}

/// Snapshot of one memspace, taken under its lock.
#[derive(Debug, Clone)]
pub struct MemspaceStats {
    pub name: String,
    pub kind: MemspaceKind,
    pub start: u64,
    pub managed_bytes: u64,
    pub reserved_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub shifts: Vec<ShiftStats>,
    /// In-use runs of exactly three minimum buffers.
    pub size3_runs: u64,
    /// In-use runs with the 24-bit length encoding, and their bytes.
    pub complex_runs: u64,
    pub complex_bytes: u64,
}

impl SpaceState {
    pub fn stats(&self) -> MemspaceStats {
        let min_shift = self.geo.min_shift;
        let shifts = (0..=self.geo.rel_max())
            .map(|r| ShiftStats {
                shift: min_shift + r,
                free_per_color: (0..self.geo.colors_at(r))
                    .map(|c| self.lists[self.geo.list_index(r, c)].count)
                    .collect(),
                used_runs: self.used.pow2_runs[r as usize],
            })
            .collect();

        MemspaceStats {
            name: self.geo.name.clone(),
            kind: self.geo.kind,
            start: self.geo.start,
            managed_bytes: self.realized_bufs << min_shift,
            reserved_bytes: self.reserved_bufs << min_shift,
            free_bytes: self.free_bufs() << min_shift,
            used_bytes: self.used.total_bufs() << min_shift,
            shifts,
            size3_runs: self.used.size3_runs,
            complex_runs: self.used.complex_runs,
            complex_bytes: self.used.complex_bufs << min_shift,
        }
    }

    /// Walk every in-use run without mutating anything. Crash-dump hook.
    pub fn for_each_allocation(&self, mut f: impl FnMut(u64, u64)) {
        for block in &self.blocks {
            if !block.is_realized() {
                continue;
            }
            let mut buf = block.base_buf;
            let end = block.base_buf + block.num_bufs;
            while buf < end {
                let st = self.status(buf);
                let nmin = match st.state() {
                    Some(BufState::Reserved) | None => 1,
                    Some(BufState::Free) => 1u32 << (st.shift() as u32 - self.geo.min_shift),
                    Some(BufState::InUse) => {
                        let nmin = match st.shift() {
                            SHIFT_SIZE3 => 3,
                            SHIFT_COMPLEX => u32::from_le_bytes([
                                self.status_raw(buf + 1),
                                self.status_raw(buf + 2),
                                self.status_raw(buf + 3),
                                0,
                            ]),
                            shift => 1u32 << (shift as u32 - self.geo.min_shift),
                        };
                        f(
                            self.geo.buf_to_addr(buf),
                            (nmin as u64) << self.geo.min_shift,
                        );
                        nmin
                    }
                };
                buf += nmin;
            }
        }
    }
}

impl fmt::Display for MemspaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "memspace {:?} ({:?}) @ {:#x}: managed {:#x} free {:#x} used {:#x} reserved {:#x}",
            self.name,
            self.kind,
            self.start,
            self.managed_bytes,
            self.free_bytes,
            self.used_bytes,
            self.reserved_bytes
        )?;
        for s in &self.shifts {
            let free_total: u32 = s.free_per_color.iter().sum();
            write!(
                f,
                "  2^{:<2} free {:>6} used {:>6}",
                s.shift, free_total, s.used_runs
            )?;
            if s.free_per_color.len() > 1 {
                write!(f, "  colors [")?;
                for (c, n) in s.free_per_color.iter().enumerate() {
                    if c > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{n}")?;
                }
                write!(f, "]")?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            "  size3 runs {}  complex runs {} ({:#x} bytes)",
            self.size3_runs, self.complex_runs, self.complex_bytes
        )
    }
}
