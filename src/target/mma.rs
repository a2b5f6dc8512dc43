//! Matrix-instruction table.
//!
//! Dispatch is a lookup over `{vendor, shape, dtypes}` records: the first
//! signature whose operand types match a gemm wins. Each signature knows
//! the per-thread fragment atom of its three operands.

use serde::{Deserialize, Serialize};

use super::{TargetCaps, Vendor};
use crate::ir::DType;
use crate::layout::fragment::Atom;

/// Operand role of a tile in a matrix instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    A,
    B,
    C,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::A => "A",
            Role::B => "B",
            Role::C => "C",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmaSignature {
    /// Instruction name as emitted by backends.
    pub name: String,
    pub vendor: Vendor,
    /// `[m, n, k]` of one instruction.
    pub shape: [u32; 3],
    pub a: DType,
    pub b: DType,
    pub acc: DType,
    /// Lanes cooperating on one instruction.
    pub warp_size: u32,
}

impl MmaSignature {
    fn new(name: &str, vendor: Vendor, shape: [u32; 3], a: DType, acc: DType) -> Self {
        Self {
            name: name.to_string(),
            vendor,
            shape,
            a,
            b: a,
            acc,
            warp_size: match vendor {
                Vendor::Nvidia => 32,
                Vendor::Amd => 64,
            },
        }
    }

    pub fn m(&self) -> u32 {
        self.shape[0]
    }

    pub fn n(&self) -> u32 {
        self.shape[1]
    }

    pub fn k(&self) -> u32 {
        self.shape[2]
    }

    pub fn matches(&self, a: DType, b: DType, acc: DType) -> bool {
        self.a == a && self.b == b && self.acc == acc
    }

    /// Per-warp fragment atom of one operand.
    pub fn atom(&self, role: Role) -> Atom {
        let [m, n, k] = self.shape;
        match self.vendor {
            Vendor::Nvidia => {
                let pack = (4 / self.a.bytes()).max(1);
                match role {
                    Role::A => Atom::MmaA { pack },
                    Role::B => Atom::MmaB { pack },
                    Role::C => Atom::MmaC,
                }
            }
            Vendor::Amd => match role {
                Role::A => Atom::MfmaA { m, k },
                Role::B => Atom::MfmaB { n, k },
                Role::C => Atom::MfmaC { m, n },
            },
        }
    }

    /// Check that the atom family can express this shape.
    pub fn validate(&self) -> Result<(), String> {
        if self.a != self.b {
            return Err(format!(
                "mma.{}: operands must share an element type ({} vs {})",
                self.name, self.a, self.b
            ));
        }
        match self.vendor {
            Vendor::Nvidia => {
                let bytes = self.a.bytes();
                if bytes > 2 {
                    return Err(format!(
                        "mma.{}: operand type {} is not a tensor-core input",
                        self.name, self.a
                    ));
                }
                let pack = 4 / bytes;
                if self.shape != [16, 8, 8 * pack] {
                    return Err(format!(
                        "mma.{}: shape {:?} does not match m16n8k{} for {}",
                        self.name,
                        self.shape,
                        8 * pack,
                        self.a
                    ));
                }
                if self.warp_size != 32 {
                    return Err(format!("mma.{}: nvidia warps have 32 lanes", self.name));
                }
            }
            Vendor::Amd => {
                if self.a.bytes() != 2 {
                    return Err(format!(
                        "mma.{}: only 16-bit operand MFMA atoms are modeled",
                        self.name
                    ));
                }
                if self.shape != [16, 16, 16] && self.shape != [32, 32, 8] {
                    return Err(format!(
                        "mma.{}: shape {:?} is not 16x16x16 or 32x32x8",
                        self.name, self.shape
                    ));
                }
                if self.warp_size != 64 {
                    return Err(format!("mma.{}: wavefronts have 64 lanes", self.name));
                }
            }
        }
        Ok(())
    }
}

pub fn nvidia_table() -> Vec<MmaSignature> {
    use DType::*;
    vec![
        MmaSignature::new("mma.m16n8k16.f32.f16.f16.f32", Vendor::Nvidia, [16, 8, 16], F16, F32),
        MmaSignature::new("mma.m16n8k16.f16.f16.f16.f16", Vendor::Nvidia, [16, 8, 16], F16, F16),
        MmaSignature::new("mma.m16n8k16.f32.bf16.bf16.f32", Vendor::Nvidia, [16, 8, 16], BF16, F32),
        MmaSignature::new("mma.m16n8k32.s32.s8.s8.s32", Vendor::Nvidia, [16, 8, 32], I8, I32),
    ]
}

pub fn amd_table() -> Vec<MmaSignature> {
    use DType::*;
    vec![
        MmaSignature::new("v_mfma_f32_16x16x16f16", Vendor::Amd, [16, 16, 16], F16, F32),
        MmaSignature::new("v_mfma_f32_32x32x8f16", Vendor::Amd, [32, 32, 8], F16, F32),
        MmaSignature::new("v_mfma_f32_16x16x16bf16_1k", Vendor::Amd, [16, 16, 16], BF16, F32),
    ]
}

/// First instruction of the target accepting these operand types.
pub fn lookup(caps: &TargetCaps, a: DType, b: DType, acc: DType) -> Option<&MmaSignature> {
    caps.mma.iter().find(|sig| sig.matches(a, b, acc))
}

/// Split `num_warps` into a `[rows, cols]` grid over an `m × n` accumulator.
///
/// Each warp's sub-tile must be a whole number of instruction tiles; among
/// the grids that fit, the one with the squarest per-warp tile wins, ties
/// going to more warps along M.
pub fn warp_partition(m: u32, n: u32, sig: &MmaSignature, num_warps: u32) -> Option<[u32; 2]> {
    if num_warps == 0 {
        return None;
    }
    let mut best: Option<([u32; 2], u32)> = None;
    for wm in (1..=num_warps).rev() {
        if num_warps % wm != 0 {
            continue;
        }
        let wn = num_warps / wm;
        if m % (sig.m() * wm) != 0 || n % (sig.n() * wn) != 0 {
            continue;
        }
        let skew = (m / wm).abs_diff(n / wn);
        if best.map_or(true, |(_, s)| skew < s) {
            best = Some(([wm, wn], skew));
        }
    }
    best.map(|(grid, _)| grid)
}
