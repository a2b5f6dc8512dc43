//! Layout model: logical tile index → physical slot.
//!
//! Memory layouts (`RowMajor`, `Padded`, `Swizzled`) map to an element
//! offset; register layouts (`Fragment`) map to a `(thread, local)` pair.
//! Tiles of rank > 2 are viewed as `rows × cols` with `cols` the innermost
//! extent.

pub mod fragment;
pub mod pattern;
pub mod resolve;
pub mod swizzle;


use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::target::{BulkEngine, TargetCaps};

pub use fragment::{Atom, FragmentLayout};
pub use pattern::{conflict_degree, AccessPattern};
pub use resolve::{resolve, LayoutRequest};
pub use swizzle::Swizzle;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    RowMajor,
    /// Row-major with `pad` unused elements after every row.
    Padded { pad: u32 },
    /// XOR swizzle applied to the row-major offset.
    Swizzled(Swizzle),
    Fragment(FragmentLayout),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub shape: Vec<u32>,
    pub kind: LayoutKind,
}

/// Where an element physically lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Offset(u64),
    Register { thread: u32, local: u32 },
}

impl Layout {
    pub fn row_major(shape: &[u32]) -> Self {
        Self {
            shape: shape.to_vec(),
            kind: LayoutKind::RowMajor,
        }
    }

    pub fn padded(shape: &[u32], pad: u32) -> Self {
        Self {
            shape: shape.to_vec(),
            kind: LayoutKind::Padded { pad },
        }
    }

    pub fn swizzled(shape: &[u32], swizzle: Swizzle) -> Self {
        Self {
            shape: shape.to_vec(),
            kind: LayoutKind::Swizzled(swizzle),
        }
    }

    pub fn fragment(shape: &[u32], fragment: FragmentLayout) -> Self {
        Self {
            shape: shape.to_vec(),
            kind: LayoutKind::Fragment(fragment),
        }
    }

    pub fn rows(&self) -> u32 {
        let n = self.shape.len();
        if n <= 1 {
            1
        } else {
            self.shape[..n - 1].iter().product()
        }
    }

    pub fn cols(&self) -> u32 {
        self.shape.last().copied().unwrap_or(1)
    }

    pub fn numel(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }

    pub fn is_fragment(&self) -> bool {
        matches!(self.kind, LayoutKind::Fragment(_))
    }

    /// Physical slot of a 2-D `(row, col)` position.
    pub fn slot_2d(&self, r: u32, c: u32) -> Slot {
        let cols = self.cols() as u64;
        let linear = r as u64 * cols + c as u64;
        match &self.kind {
            LayoutKind::RowMajor => Slot::Offset(linear),
            LayoutKind::Padded { pad } => Slot::Offset(r as u64 * (cols + *pad as u64) + c as u64),
            LayoutKind::Swizzled(s) => Slot::Offset(s.apply(linear)),
            LayoutKind::Fragment(f) => {
                let (thread, local) = f.slot(self.rows(), self.cols(), r, c);
                Slot::Register { thread, local }
            }
        }
    }

    /// Physical slot of a full index tuple.
    pub fn slot(&self, index: &[u32]) -> Slot {
        let (r, c) = self.split(index);
        self.slot_2d(r, c)
    }

    /// Element offset in memory; `None` for register layouts.
    pub fn offset(&self, index: &[u32]) -> Option<u64> {
        match self.slot(index) {
            Slot::Offset(o) => Some(o),
            Slot::Register { .. } => None,
        }
    }

    /// Shared-memory bank serving the first byte of the element.
    pub fn bank(&self, index: &[u32], elem_bytes: u32, caps: &TargetCaps) -> Option<u32> {
        let offset = self.offset(index)?;
        let byte = offset * elem_bytes as u64;
        Some(((byte / caps.shared.bank_bytes as u64) % caps.shared.banks as u64) as u32)
    }

    /// Number of physical slots the layout spans (elements or registers).
    pub fn footprint(&self) -> u64 {
        match &self.kind {
            LayoutKind::RowMajor | LayoutKind::Swizzled(_) => self.numel(),
            LayoutKind::Padded { pad } => self.rows() as u64 * (self.cols() + pad) as u64,
            LayoutKind::Fragment(f) => f.threads() as u64 * f.locals_per_thread(self.numel()),
        }
    }

    /// Whether the shape parameters of the kind are usable for this shape.
    pub fn is_well_formed(&self) -> bool {
        if self.shape.is_empty() || self.shape.contains(&0) {
            return false;
        }
        match &self.kind {
            LayoutKind::RowMajor | LayoutKind::Padded { .. } => true,
            LayoutKind::Swizzled(s) => s.is_well_formed() && self.numel() % s.period() == 0,
            LayoutKind::Fragment(f) => f.fits(self.rows(), self.cols()),
        }
    }

    /// No two logical indices share a slot, and every slot is inside the
    /// footprint.
    pub fn is_injective(&self) -> bool {
        if !self.is_well_formed() {
            return false;
        }
        let footprint = self.footprint();
        let mut seen = HashSet::with_capacity(self.numel() as usize);
        for r in 0..self.rows() {
            for c in 0..self.cols() {
                let slot = self.slot_2d(r, c);
                let inside = match slot {
                    Slot::Offset(o) => o < footprint,
                    Slot::Register { thread, local } => match &self.kind {
                        LayoutKind::Fragment(f) => {
                            thread < f.threads()
                                && (local as u64) < f.locals_per_thread(self.numel())
                        }
                        _ => false,
                    },
                };
                if !inside || !seen.insert(slot) {
                    return false;
                }
            }
        }
        true
    }

    /// Shortest run of consecutive columns that land in consecutive slots
    /// (offset + 1, or same thread and local + 1). This bounds the vector
    /// width usable against the layout.
    pub fn contiguous_run(&self) -> u32 {
        let cols = self.cols();
        if cols == 0 {
            return 0;
        }
        let mut shortest = cols;
        for r in 0..self.rows() {
            let mut run = 1;
            let mut prev = self.slot_2d(r, 0);
            for c in 1..cols {
                let next = self.slot_2d(r, c);
                if is_successor(prev, next) {
                    run += 1;
                } else {
                    shortest = shortest.min(run);
                    run = 1;
                }
                prev = next;
            }
            shortest = shortest.min(run);
            if shortest == 1 {
                break;
            }
        }
        shortest
    }

    /// Can the target's bulk-copy engine write this layout directly?
    pub fn is_bulk_copy_compatible(&self, elem_bytes: u32, caps: &TargetCaps) -> bool {
        let Some(bulk) = caps.bulk_copy else {
            return false;
        };
        match bulk.engine {
            BulkEngine::Tma => match &self.kind {
                LayoutKind::RowMajor => true,
                LayoutKind::Swizzled(s) => s.is_hardware_mode(elem_bytes),
                _ => false,
            },
            // 16-byte per-thread copies: any memory layout keeping chunks intact
            BulkEngine::CpAsync => {
                !self.is_fragment()
                    && self.contiguous_run() * elem_bytes >= swizzle::CHUNK_BYTES
            }
        }
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            LayoutKind::RowMajor => "row_major".to_string(),
            LayoutKind::Padded { pad } => format!("padded(+{})", pad),
            LayoutKind::Swizzled(s) => format!("swizzle<{},{},{}>", s.bits, s.base, s.shift),
            LayoutKind::Fragment(f) => f.describe(),
        }
    }

    fn split(&self, index: &[u32]) -> (u32, u32) {
        let n = index.len();
        if n == 0 {
            return (0, 0);
        }
        let mut row = 0;
        for (i, &ix) in index[..n - 1].iter().enumerate() {
            row = row * self.shape.get(i).copied().unwrap_or(1) + ix;
        }
        (row, index[n - 1])
    }
}

fn is_successor(prev: Slot, next: Slot) -> bool {
    match (prev, next) {
        (Slot::Offset(a), Slot::Offset(b)) => b == a + 1,
        (
            Slot::Register {
                thread: ta,
                local: la,
            },
            Slot::Register {
                thread: tb,
                local: lb,
            },
        ) => ta == tb && lb == la + 1,
        _ => false,
    }
}
