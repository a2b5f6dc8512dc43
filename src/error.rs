//! Error kinds of every pass.
//!
//! Each error names the tile or op it concerns and the constraint that was
//! violated, and converts into a `Diagnostic` that points at that site in
//! the kernel listing.

use thiserror::Error;

use crate::diagnostic::Diagnostic;
use crate::ir::OpId;
use crate::span::Site;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("tile '{tile}' has degenerate shape {shape:?}")]
    DegenerateShape { tile: String, shape: Vec<u32> },

    #[error(
        "no bank-conflict-free shared layout for tile '{tile}' (best candidate {best} is {degree}-way conflicted)"
    )]
    NoConflictFree {
        tile: String,
        patterns: Vec<String>,
        best: String,
        degree: u32,
    },

    #[error("incompatible fragment shape {shape:?} for tile '{tile}' under {instruction}: {reason}")]
    IncompatibleFragmentShape {
        tile: String,
        shape: Vec<u32>,
        instruction: String,
        reason: String,
    },

    #[error("tile '{tile}' is required to be both {first} and {second}")]
    ConflictingFragments {
        tile: String,
        first: String,
        second: String,
    },

    #[error("declared layout of tile '{tile}' is invalid: {reason}")]
    InvalidDeclaredLayout { tile: String, reason: String },
}

impl LayoutError {
    pub fn tile(&self) -> &str {
        match self {
            LayoutError::DegenerateShape { tile, .. }
            | LayoutError::NoConflictFree { tile, .. }
            | LayoutError::IncompatibleFragmentShape { tile, .. }
            | LayoutError::ConflictingFragments { tile, .. }
            | LayoutError::InvalidDeclaredLayout { tile, .. } => tile,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::error(self.to_string(), Site::Tile(self.tile().to_string()));
        match self {
            LayoutError::NoConflictFree { patterns, .. } => diag
                .with_note(format!("access patterns: {}", patterns.join(", ")))
                .with_help("declare a layout for the tile to accept the conflicts".to_string()),
            LayoutError::IncompatibleFragmentShape { .. } => diag.with_help(
                "choose block sizes that are multiples of the instruction shape times the warp grid"
                    .to_string(),
            ),
            _ => diag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("no access pattern for tile '{tile}': it is declared but never used")]
    NoAccessPattern { tile: String },

    #[error("op {op} references tile {tile} which is not declared")]
    UnknownTile { op: OpId, tile: u32 },

    #[error("op id {op} is used by more than one op")]
    DuplicateOpId { op: OpId },

    #[error("op {op} has mismatched shapes on tile '{tile}': {reason}")]
    ShapeMismatch {
        op: OpId,
        tile: String,
        reason: String,
    },

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

impl InferenceError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            InferenceError::NoAccessPattern { tile } => {
                Diagnostic::error(self.to_string(), Site::Tile(tile.clone()))
                    .with_help("remove the declaration or use the tile".to_string())
            }
            InferenceError::UnknownTile { op, .. } | InferenceError::DuplicateOpId { op } => {
                Diagnostic::error(self.to_string(), Site::Op(*op))
            }
            InferenceError::ShapeMismatch { op, .. } => {
                Diagnostic::error(self.to_string(), Site::Op(*op))
            }
            InferenceError::Layout(e) => e.to_diagnostic(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("op {op} is not a pipelined region")]
    NotARegion { op: OpId },

    #[error("pipelined region {inner} is nested inside region {region}")]
    NestedRegion { region: OpId, inner: OpId },

    #[error(
        "unsupported dependency in region {region}: op {reader} reads tile '{tile}' written by op {writer} ({reason})"
    )]
    UnsupportedDependency {
        region: OpId,
        reader: OpId,
        writer: OpId,
        tile: String,
        reason: String,
    },

    #[error("tile '{tile}' used in region {region} has no resolved layout")]
    UnresolvedLayout { region: OpId, tile: String },

    #[error(
        "region {region} needs {required} bytes of shared memory with {stages} stages, target has {available}"
    )]
    SharedMemoryExceeded {
        region: OpId,
        stages: u32,
        required: u64,
        available: u64,
    },
}

impl ScheduleError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            ScheduleError::NotARegion { op } => Diagnostic::error(self.to_string(), Site::Op(*op)),
            ScheduleError::NestedRegion { inner, .. } => {
                Diagnostic::error(self.to_string(), Site::Op(*inner))
            }
            ScheduleError::UnsupportedDependency { reader, .. } => {
                Diagnostic::error(self.to_string(), Site::Op(*reader)).with_note(
                    "values may only flow from producers to consumers of the same iteration"
                        .to_string(),
                )
            }
            ScheduleError::UnresolvedLayout { tile, .. } => {
                Diagnostic::error(self.to_string(), Site::Tile(tile.clone()))
                    .with_help("run layout inference before scheduling".to_string())
            }
            ScheduleError::SharedMemoryExceeded { region, .. } => {
                Diagnostic::error(self.to_string(), Site::Op(*region))
                    .with_help("reduce the stage count or the block tile sizes".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("op {op}: tile '{tile}' does not satisfy {constraint}")]
    LayoutMismatch {
        op: OpId,
        tile: String,
        constraint: String,
    },
}

impl SelectionError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            SelectionError::LayoutMismatch { op, .. } => {
                Diagnostic::error(self.to_string(), Site::Op(*op))
            }
        }
    }
}

/// Divergence found by the schedule simulator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    #[error(
        "region {region}: slot {slot} reused before the consumers of iteration {iter} finished"
    )]
    ReleaseViolation { region: OpId, iter: u64, slot: u32 },

    #[error("staged execution differs from sequential execution in tile '{tile}': {detail}")]
    Mismatch { tile: String, detail: String },
}

impl SimulationError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            SimulationError::ReleaseViolation { region, .. } => {
                Diagnostic::error(self.to_string(), Site::Op(*region))
            }
            SimulationError::Mismatch { tile, .. } => {
                Diagnostic::error(self.to_string(), Site::Tile(tile.clone()))
            }
        }
    }
}

/// Any failure of the pass sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

impl From<LayoutError> for CompileError {
    fn from(e: LayoutError) -> Self {
        CompileError::Inference(InferenceError::Layout(e))
    }
}

impl CompileError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            CompileError::Inference(e) => e.to_diagnostic(),
            CompileError::Schedule(e) => e.to_diagnostic(),
            CompileError::Selection(e) => e.to_diagnostic(),
            CompileError::Simulation(e) => e.to_diagnostic(),
        }
    }
}
