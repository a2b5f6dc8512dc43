//! The pass sequence shared by every entry point.
//!
//! infer → schedule → select, each taking the kernel by value. The first
//! failing pass aborts the run; nothing partially annotated escapes.

use tracing::info;

use crate::diagnostic::Diagnostic;
use crate::error::CompileError;
use crate::infer::{self, RelayoutRecord};
use crate::ir::display::listing;
use crate::ir::Kernel;
use crate::schedule;
use crate::select;
use crate::target::TargetCaps;

/// A fully annotated kernel.
#[derive(Clone, Debug)]
pub struct Compiled {
    pub kernel: Kernel,
    /// Recoverable findings (inserted re-layouts, accepted conflicts).
    pub warnings: Vec<Diagnostic>,
    pub relayouts: Vec<RelayoutRecord>,
    /// blake3 of the annotated listing; stable across runs for equal input.
    pub fingerprint: String,
}

pub fn run_passes(kernel: Kernel, caps: &TargetCaps) -> Result<Compiled, CompileError> {
    let name = kernel.name.clone();
    let inferred = infer::infer(kernel, caps)?;
    let kernel = schedule::schedule(inferred.kernel, caps)?;
    let kernel = select::select_kernel(kernel, caps)?;
    let fingerprint = fingerprint(&kernel);
    info!(
        "compiled {} for {}: {} warnings, {} re-layouts",
        name,
        caps.name,
        inferred.diagnostics.len(),
        inferred.relayouts.len()
    );
    Ok(Compiled {
        kernel,
        warnings: inferred.diagnostics,
        relayouts: inferred.relayouts,
        fingerprint,
    })
}

pub fn fingerprint(kernel: &Kernel) -> String {
    blake3::hash(listing(kernel).text.as_bytes())
        .to_hex()
        .to_string()
}
