pub mod pipeline;


use std::path::Path;

use crate::diagnostic::{render_diagnostics, Diagnostic};
use crate::error::CompileError;
use crate::ir::display::listing;
use crate::ir::Kernel;
use crate::schedule::simulate::{self, SimOptions, Verified};
use crate::span::Site;
use crate::target::TargetCaps;
use crate::tensor::{TensorSupply, Tolerance};

pub use pipeline::{fingerprint, run_passes, Compiled};

/// Options controlling compilation: target descriptor plus optional
/// simulation of the staged schedule.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub target: TargetCaps,
    /// Run the schedule simulator after compiling and fail on divergence.
    pub verify_schedule: bool,
    /// Input contents used by the simulator.
    pub supply: TensorSupply,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            target: TargetCaps::sm80(),
            verify_schedule: false,
            supply: TensorSupply::Integer,
        }
    }
}

impl CompileOptions {
    /// Options for a target by name (built-in, `auto`, or descriptor file).
    pub fn for_target(name: &str) -> Result<Self, Diagnostic> {
        Ok(Self {
            target: TargetCaps::resolve(name)?,
            ..Self::default()
        })
    }
}

/// Compile a kernel with default options (sm80).
pub fn compile(kernel: Kernel) -> Result<Compiled, Vec<Diagnostic>> {
    compile_with_options(kernel, &CompileOptions::default())
}

/// Run the pass sequence. Errors are rendered against the input listing;
/// warnings against the annotated one.
pub fn compile_with_options(
    kernel: Kernel,
    options: &CompileOptions,
) -> Result<Compiled, Vec<Diagnostic>> {
    let filename = format!("{}.tile", kernel.name);
    let input = listing(&kernel);
    let compiled = match run_passes(kernel, &options.target) {
        Ok(c) => c,
        Err(e) => {
            let diags = vec![e.to_diagnostic()];
            render_diagnostics(&diags, &filename, &input.text, &input.spans);
            return Err(diags);
        }
    };

    let output = listing(&compiled.kernel);
    render_diagnostics(&compiled.warnings, &filename, &output.text, &output.spans);

    if options.verify_schedule {
        let opts = SimOptions {
            supply: options.supply,
            ..SimOptions::default()
        };
        if let Err(e) = simulate::verify(&compiled.kernel, &opts, Tolerance::default()) {
            let diags = vec![CompileError::from(e).to_diagnostic()];
            render_diagnostics(&diags, &filename, &output.text, &output.spans);
            return Err(diags);
        }
    }
    Ok(compiled)
}

/// Run every pass and report diagnostics without keeping the result.
pub fn check(
    kernel: Kernel,
    options: &CompileOptions,
) -> Result<Vec<Diagnostic>, Vec<Diagnostic>> {
    compile_with_options(kernel, options).map(|c| c.warnings)
}

/// Compile, then compare staged against sequential execution.
pub fn verify(
    kernel: Kernel,
    options: &CompileOptions,
    sim: &SimOptions,
) -> Result<Verified, Vec<Diagnostic>> {
    let compiled = compile_with_options(kernel, options)?;
    simulate::verify(&compiled.kernel, sim, Tolerance::default()).map_err(|e| {
        let output = listing(&compiled.kernel);
        let diags = vec![e.to_diagnostic()];
        let filename = format!("{}.tile", compiled.kernel.name);
        render_diagnostics(&diags, &filename, &output.text, &output.spans);
        diags
    })
}

/// Read a kernel from its JSON form.
pub fn load_kernel(path: &Path) -> Result<Kernel, Diagnostic> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Diagnostic::error(
            format!("cannot read '{}': {}", path.display(), e),
            Site::Nowhere,
        )
    })?;
    serde_json::from_str(&text).map_err(|e| {
        Diagnostic::error(
            format!("invalid kernel '{}': {}", path.display(), e),
            Site::Nowhere,
        )
    })
}

/// Write a kernel as pretty-printed JSON.
pub fn save_kernel(kernel: &Kernel, path: &Path) -> Result<(), Diagnostic> {
    let text = serde_json::to_string_pretty(kernel).map_err(|e| {
        Diagnostic::error(format!("cannot serialize kernel: {}", e), Site::Nowhere)
    })?;
    std::fs::write(path, text).map_err(|e| {
        Diagnostic::error(
            format!("cannot write '{}': {}", path.display(), e),
            Site::Nowhere,
        )
    })
}
