//! Access patterns and bank-conflict measurement.
//!
//! A pattern describes how the lanes of a warp walk a tile. It is split
//! into *phases*: the groups of lane accesses the shared-memory unit serves
//! together (one bank line per phase). Within a phase, two lanes touching
//! different words of the same bank serialize; the worst such count is the
//! conflict degree.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::fragment::FragmentLayout;
use super::swizzle::CHUNK_BYTES;
use super::{Layout, Slot};
use crate::target::TargetCaps;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPattern {
    /// Lanes walk the tile in row-major order, `vector` elements per lane.
    RowMajor { vector: u32 },
    /// Each lane owns a row; the warp touches one column at a time.
    ColumnMajor,
    /// Matrix-instruction operand. Register tiles must match the fragment
    /// exactly; shared tiles are fetched as 16-byte row chunks, eight rows
    /// per phase.
    Operand(FragmentLayout),
}

/// One lane's access: `(row, col, elements)`.
type LaneAccess = (u32, u32, u32);

impl AccessPattern {
    pub fn describe(&self) -> String {
        match self {
            AccessPattern::RowMajor { vector } => format!("row-major x{}", vector),
            AccessPattern::ColumnMajor => "column-major".to_string(),
            AccessPattern::Operand(f) => format!("operand {}", f.describe()),
        }
    }

    /// Lane accesses grouped by phase, for a `rows × cols` tile.
    pub fn phases(
        &self,
        rows: u32,
        cols: u32,
        elem_bytes: u32,
        caps: &TargetCaps,
    ) -> Vec<Vec<LaneAccess>> {
        let line = caps.shared.line_bytes();
        let warp = caps.warp_size.max(1);
        let mut phases = Vec::new();
        match self {
            AccessPattern::RowMajor { vector } => {
                let v = fit_vector(*vector, cols);
                let per_phase = (line / (v * elem_bytes).max(1)).clamp(1, warp);
                let chunks = rows as u64 * (cols / v) as u64;
                let mut phase = Vec::with_capacity(per_phase as usize);
                for chunk in 0..chunks {
                    let e = chunk * v as u64;
                    phase.push(((e / cols as u64) as u32, (e % cols as u64) as u32, v));
                    if phase.len() == per_phase as usize {
                        phases.push(std::mem::take(&mut phase));
                    }
                }
                if !phase.is_empty() {
                    phases.push(phase);
                }
            }
            AccessPattern::ColumnMajor => {
                let per_phase = (line / elem_bytes.max(1)).clamp(1, warp);
                for c in 0..cols {
                    let mut r = 0;
                    while r < rows {
                        let end = (r + per_phase).min(rows);
                        phases.push((r..end).map(|row| (row, c, 1)).collect());
                        r = end;
                    }
                }
            }
            AccessPattern::Operand(_) => {
                let v = fit_vector((CHUNK_BYTES / elem_bytes.max(1)).max(1), cols);
                let per_phase = (line / CHUNK_BYTES).max(1);
                let mut r = 0;
                while r < rows {
                    let end = (r + per_phase).min(rows);
                    for c in (0..cols).step_by(v as usize) {
                        phases.push((r..end).map(|row| (row, c, v)).collect());
                    }
                    r = end;
                }
            }
        }
        phases
    }
}

/// Largest width ≤ `vector` that divides `cols`.
pub(crate) fn fit_vector(vector: u32, cols: u32) -> u32 {
    let mut v = vector.clamp(1, cols.max(1));
    while v > 1 && cols % v != 0 {
        v -= 1;
    }
    v
}

/// Worst-case number of distinct words one bank must serve in a single
/// phase of `pattern` over `layout`. 1 means conflict free; 0 means the
/// pattern touches nothing or the layout is a register layout.
pub fn conflict_degree(
    layout: &Layout,
    pattern: &AccessPattern,
    elem_bytes: u32,
    caps: &TargetCaps,
) -> u32 {
    if layout.is_fragment() {
        return 0;
    }
    let bank_bytes = caps.shared.bank_bytes.max(1) as u64;
    let banks = caps.shared.banks.max(1) as u64;
    let mut worst = 0;
    let mut words: HashMap<u64, HashSet<u64>> = HashMap::new();
    for phase in pattern.phases(layout.rows(), layout.cols(), elem_bytes, caps) {
        words.clear();
        for (r, c, n) in phase {
            for i in 0..n {
                let Slot::Offset(offset) = layout.slot_2d(r, c + i) else {
                    continue;
                };
                let first = offset * elem_bytes as u64;
                let last = first + elem_bytes as u64 - 1;
                for word in first / bank_bytes..=last / bank_bytes {
                    words.entry(word % banks).or_default().insert(word);
                }
            }
        }
        let phase_worst = words.values().map(|w| w.len() as u32).max().unwrap_or(0);
        worst = worst.max(phase_worst);
    }
    worst
}
