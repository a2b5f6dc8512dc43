//! Synthetic tensor contents and tolerance comparison for simulation.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::ir::DType;

/// How input tensors are filled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorSupply {
    /// Integers in `-2..3`; exact under any accumulation order.
    #[default]
    Integer,
    /// Uniform in `[-1, 1)`.
    Uniform,
    /// Normal with mean -1 and standard deviation 1.
    Normal,
    /// Standard normal.
    Randn,
    Zero,
    One,
}

impl FromStr for TensorSupply {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "integer" => Ok(TensorSupply::Integer),
            "uniform" => Ok(TensorSupply::Uniform),
            "normal" => Ok(TensorSupply::Normal),
            "randn" => Ok(TensorSupply::Randn),
            "zero" => Ok(TensorSupply::Zero),
            "one" => Ok(TensorSupply::One),
            other => Err(format!(
                "unknown supply '{}' (expected integer, uniform, normal, randn, zero or one)",
                other
            )),
        }
    }
}

/// Deterministic generator of tensor contents.
pub struct Supplier {
    supply: TensorSupply,
    rng: StdRng,
}

impl Supplier {
    pub fn new(supply: TensorSupply, seed: u64) -> Self {
        Self {
            supply,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn generate(&mut self, numel: usize, dtype: DType) -> Vec<f64> {
        let supply = match (dtype, self.supply) {
            // 8-bit integers cannot hold continuous samples
            (DType::I8, TensorSupply::Uniform | TensorSupply::Normal | TensorSupply::Randn) => {
                TensorSupply::One
            }
            (_, s) => s,
        };
        (0..numel).map(|_| self.sample(supply)).collect()
    }

    fn sample(&mut self, supply: TensorSupply) -> f64 {
        match supply {
            TensorSupply::Integer => self.rng.gen_range(-2i64..3) as f64,
            TensorSupply::Uniform => self.rng.gen_range(-1.0..1.0),
            TensorSupply::Normal => {
                Normal::new(-1.0, 1.0).map_or(-1.0, |d| d.sample(&mut self.rng))
            }
            TensorSupply::Randn => self.rng.sample(StandardNormal),
            TensorSupply::Zero => 0.0,
            TensorSupply::One => 1.0,
        }
    }
}

/// Acceptance thresholds for comparing two tensors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
    /// Fraction of elements allowed to exceed `atol + rtol·|expected|`.
    pub max_mismatched_ratio: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-2,
            atol: 1e-3,
            max_mismatched_ratio: 0.001,
        }
    }
}

impl Tolerance {
    pub fn exact() -> Self {
        Self {
            rtol: 0.0,
            atol: 0.0,
            max_mismatched_ratio: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mismatch {
    pub mismatched: usize,
    pub allowed: usize,
    pub total: usize,
    pub max_abs_diff: f64,
    /// First offending `(index, actual, expected)`.
    pub first: Option<(usize, f64, f64)>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} elements mismatched ({} allowed), greatest absolute difference {}",
            self.mismatched, self.total, self.allowed, self.max_abs_diff
        )?;
        if let Some((i, a, e)) = self.first {
            write!(f, ", first at [{}]: {} vs {}", i, a, e)?;
        }
        Ok(())
    }
}

/// Compare `actual` against `expected`, allowing a bounded fraction of
/// elements outside the tolerance.
pub fn assert_close(actual: &[f64], expected: &[f64], tol: Tolerance) -> Result<(), Mismatch> {
    let total = actual.len().max(expected.len());
    let allowed = (total as f64 * tol.max_mismatched_ratio) as usize;
    let mut mismatched = total - actual.len().min(expected.len());
    let mut max_abs_diff: f64 = 0.0;
    let mut first = None;
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let diff = (a - e).abs();
        let bad = if a.is_nan() || e.is_nan() {
            a.is_nan() != e.is_nan()
        } else if a.is_infinite() || e.is_infinite() {
            a != e
        } else {
            diff > tol.atol + tol.rtol * e.abs()
        };
        if bad {
            mismatched += 1;
            if first.is_none() {
                first = Some((i, a, e));
            }
        }
        if diff.is_finite() {
            max_abs_diff = max_abs_diff.max(diff);
        }
    }
    if mismatched > allowed {
        Err(Mismatch {
            mismatched,
            allowed,
            total,
            max_abs_diff,
            first,
        })
    } else {
        Ok(())
    }
}
