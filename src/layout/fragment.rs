//! Per-thread register layouts.
//!
//! An `Atom` is the fragment one warp holds for one matrix instruction
//! operand. A `FragmentLayout::Operand` tiles atoms over a warp grid and
//! repeats them until the whole tile is covered:
//!
//! ```text
//!   tile (rows × cols) = warps[0]·reps_m·atom.rows × warps[1]·reps_n·atom.cols
//!   thread = warp · lanes + lane
//!   local  = rep · atom.locals + atom_local
//! ```

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;
use crate::ir::{Kernel, OpKind, Scope};
use crate::target::mma::{self, MmaSignature, Role};
use crate::target::TargetCaps;

/// Register fragment of one warp for one instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atom {
    /// `mma.sync` A operand (16 × 8·pack); `pack` elements share a 32-bit register.
    MmaA { pack: u32 },
    /// `mma.sync` B operand (8·pack × 8), indexed (k, n).
    MmaB { pack: u32 },
    /// `mma.sync` accumulator (16 × 8).
    MmaC,
    /// MFMA A operand (m × k), four consecutive k per lane.
    MfmaA { m: u32, k: u32 },
    /// MFMA B operand (k × n), four consecutive k per lane.
    MfmaB { n: u32, k: u32 },
    /// MFMA accumulator (m × n), four consecutive rows per lane.
    MfmaC { m: u32, n: u32 },
}

impl Atom {
    pub fn rows(self) -> u32 {
        match self {
            Atom::MmaA { .. } | Atom::MmaC => 16,
            Atom::MmaB { pack } => 8 * pack,
            Atom::MfmaA { m, .. } | Atom::MfmaC { m, .. } => m,
            Atom::MfmaB { k, .. } => k,
        }
    }

    pub fn cols(self) -> u32 {
        match self {
            Atom::MmaA { pack } => 8 * pack,
            Atom::MmaB { .. } | Atom::MmaC => 8,
            Atom::MfmaA { k, .. } => k,
            Atom::MfmaB { n, .. } | Atom::MfmaC { n, .. } => n,
        }
    }

    pub fn lanes(self) -> u32 {
        match self {
            Atom::MmaA { .. } | Atom::MmaB { .. } | Atom::MmaC => 32,
            _ => 64,
        }
    }

    /// Registers (elements) each lane holds.
    pub fn locals(self) -> u32 {
        self.rows() * self.cols() / self.lanes()
    }

    /// `(lane, local)` of element `(r, c)` of the atom.
    pub fn slot(self, r: u32, c: u32) -> (u32, u32) {
        match self {
            Atom::MmaA { pack } => {
                let lane = (r % 8) * 4 + (c % (4 * pack)) / pack;
                let local = c % pack + pack * ((r / 8) % 2) + 2 * pack * (c / (4 * pack));
                (lane, local)
            }
            Atom::MmaB { pack } => {
                let lane = c * 4 + (r % (4 * pack)) / pack;
                let local = r % pack + pack * (r / (4 * pack));
                (lane, local)
            }
            Atom::MmaC => {
                let lane = (r % 8) * 4 + (c % 8) / 2;
                let local = c % 2 + 2 * (r / 8);
                (lane, local)
            }
            Atom::MfmaA { m, .. } => (r + m * (c / 4), c % 4),
            Atom::MfmaB { n, .. } => (c + n * (r / 4), r % 4),
            Atom::MfmaC { n, .. } => {
                // 16x16: 4 row groups of 4; 32x32: 2 lane groups, 4 register groups
                let groups = self.lanes() / n;
                let lane = c + n * ((r / 4) % groups);
                let local = (r / (4 * groups)) * 4 + r % 4;
                (lane, local)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentLayout {
    /// Layout demanded by a matrix instruction.
    Operand {
        atom: Atom,
        /// Warp grid `[rows, cols]` this tile is split over.
        warps: [u32; 2],
        /// Copies of the fragment held across the block (A is shared by
        /// every warp column, B by every warp row).
        replicas: u32,
        /// The tile is stored transposed relative to the operand.
        transposed: bool,
    },
    /// Row-major elements dealt to threads in runs of `vector`.
    Striped { threads: u32, vector: u32 },
}

impl FragmentLayout {
    /// `(thread, local)` of `(r, c)` in a tile of `rows × cols`.
    pub fn slot(&self, rows: u32, cols: u32, r: u32, c: u32) -> (u32, u32) {
        match *self {
            FragmentLayout::Operand {
                atom,
                warps,
                transposed,
                ..
            } => {
                let (r, c, rows, cols) = if transposed {
                    (c, r, cols, rows)
                } else {
                    (r, c, rows, cols)
                };
                let reps_m = (rows / (atom.rows() * warps[0])).max(1);
                let reps_n = (cols / (atom.cols() * warps[1])).max(1);
                let (br, bc) = (r / atom.rows(), c / atom.cols());
                let warp = (br / reps_m) * warps[1] + bc / reps_n;
                let rep = (br % reps_m) * reps_n + bc % reps_n;
                let (lane, local) = atom.slot(r % atom.rows(), c % atom.cols());
                (warp * atom.lanes() + lane, rep * atom.locals() + local)
            }
            FragmentLayout::Striped { threads, vector } => {
                let e = r * cols + c;
                let chunk = e / vector;
                (chunk % threads, (chunk / threads) * vector + e % vector)
            }
        }
    }

    pub fn threads(&self) -> u32 {
        match *self {
            FragmentLayout::Operand { atom, warps, .. } => warps[0] * warps[1] * atom.lanes(),
            FragmentLayout::Striped { threads, .. } => threads,
        }
    }

    /// Registers per thread for a tile of `numel` elements.
    pub fn locals_per_thread(&self, numel: u64) -> u64 {
        let threads = self.threads().max(1) as u64;
        match *self {
            FragmentLayout::Operand { .. } => numel.div_ceil(threads),
            FragmentLayout::Striped { vector, .. } => {
                let per_round = threads * vector as u64;
                numel.div_ceil(per_round) * vector as u64
            }
        }
    }

    /// Does the atom grid tile `rows × cols` exactly?
    pub fn fits(&self, rows: u32, cols: u32) -> bool {
        match *self {
            FragmentLayout::Operand {
                atom,
                warps,
                transposed,
                ..
            } => {
                let (rows, cols) = if transposed { (cols, rows) } else { (rows, cols) };
                rows % (atom.rows() * warps[0]) == 0 && cols % (atom.cols() * warps[1]) == 0
            }
            FragmentLayout::Striped { threads, vector } => {
                threads > 0 && vector > 0 && cols % vector == 0
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FragmentLayout::Operand {
                atom,
                warps,
                replicas,
                transposed,
            } => format!(
                "fragment({:?} warps={}x{}{}{})",
                atom,
                warps[0],
                warps[1],
                if *replicas > 1 {
                    format!(" x{}", replicas)
                } else {
                    String::new()
                },
                if *transposed { " T" } else { "" }
            ),
            FragmentLayout::Striped { threads, vector } => {
                format!("striped(threads={}, vector={})", threads, vector)
            }
        }
    }
}

// ─── Gemm binding ──────────────────────────────────────────────────

/// Problem sizes of one gemm, in operand order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GemmDims {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

/// A gemm mapped onto one matrix instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GemmBinding {
    pub sig: MmaSignature,
    pub dims: GemmDims,
    /// Warp grid over the accumulator.
    pub warps: [u32; 2],
}

impl GemmBinding {
    /// Instruction repeats per warp along m, n and k.
    pub fn repeats(&self) -> [u32; 3] {
        [
            self.dims.m / (self.sig.m() * self.warps[0]),
            self.dims.n / (self.sig.n() * self.warps[1]),
            self.dims.k / self.sig.k(),
        ]
    }

    /// The exact fragment layout a register operand must have.
    pub fn operand_layout(&self, role: Role, transposed: bool) -> FragmentLayout {
        let [wm, wn] = self.warps;
        let (warps, replicas) = match role {
            Role::A => ([wm, 1], wn),
            Role::B => ([1, wn], wm),
            Role::C => ([wm, wn], 1),
        };
        FragmentLayout::Operand {
            atom: self.sig.atom(role),
            warps,
            replicas,
            transposed,
        }
    }
}

/// Shapes of the gemm operands: `(m, k)` from A, `(k, n)` from B.
pub fn gemm_dims(
    a: &[u32],
    b: &[u32],
    c: &[u32],
    transpose_a: bool,
    transpose_b: bool,
) -> Option<GemmDims> {
    if a.len() != 2 || b.len() != 2 || c.len() != 2 {
        return None;
    }
    let (m, ka) = if transpose_a { (a[1], a[0]) } else { (a[0], a[1]) };
    let (kb, n) = if transpose_b { (b[1], b[0]) } else { (b[0], b[1]) };
    if ka != kb || c[0] != m || c[1] != n {
        return None;
    }
    Some(GemmDims { m, n, k: ka })
}

/// Map a gemm op to a matrix instruction of the target.
///
/// `Ok(None)` when the operand types or scopes rule out every instruction
/// (the op falls back to scalar code). An instruction whose types match but
/// whose shape cannot tile the operands is an error for register operands:
/// their layout can only be the instruction's.
pub fn bind_gemm(
    kernel: &Kernel,
    kind: &OpKind,
    caps: &TargetCaps,
) -> Result<Option<GemmBinding>, LayoutError> {
    let OpKind::Gemm {
        a,
        b,
        c,
        transpose_a,
        transpose_b,
        ..
    } = kind
    else {
        return Ok(None);
    };
    let (ta, tb, tc) = (kernel.tile(*a), kernel.tile(*b), kernel.tile(*c));
    if tc.scope != Scope::Fragment || !ta.scope.is_on_chip() || !tb.scope.is_on_chip() {
        return Ok(None);
    }
    let Some(sig) = mma::lookup(caps, ta.dtype, tb.dtype, tc.dtype) else {
        return Ok(None);
    };
    let Some(dims) = gemm_dims(&ta.shape, &tb.shape, &tc.shape, *transpose_a, *transpose_b)
    else {
        return Err(LayoutError::IncompatibleFragmentShape {
            tile: tc.name.clone(),
            shape: tc.shape.clone(),
            instruction: sig.name.clone(),
            reason: format!(
                "operand shapes {:?} x {:?} -> {:?} do not form a matrix product",
                ta.shape, tb.shape, tc.shape
            ),
        });
    };
    let warp_size = sig.warp_size.max(1);
    let threads = kernel.num_threads();
    let warps = if threads % warp_size == 0 {
        mma::warp_partition(dims.m, dims.n, sig, threads / warp_size)
    } else {
        None
    };
    let k_fits = dims.k % sig.k() == 0;
    match warps {
        Some(warps) if k_fits => Ok(Some(GemmBinding {
            sig: sig.clone(),
            dims,
            warps,
        })),
        _ => Err(LayoutError::IncompatibleFragmentShape {
            tile: tc.name.clone(),
            shape: tc.shape.clone(),
            instruction: sig.name.clone(),
            reason: format!(
                "m={} n={} k={} with {} threads cannot be split into {}x{}x{} tiles per warp",
                dims.m,
                dims.n,
                dims.k,
                threads,
                sig.m(),
                sig.n(),
                sig.k()
            ),
        }),
    }
}
