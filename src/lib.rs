pub mod api;
pub mod diagnostic;
pub mod error;
pub mod infer;
pub mod ir;
pub mod kernels;
pub mod layout;
pub mod raster;
pub mod schedule;
pub mod select;
pub mod span;
pub mod target;
pub mod tensor;

// Re-export public API, so callers write `tilec::compile()`.
pub use api::*;
pub use error::{
    CompileError, InferenceError, LayoutError, ScheduleError, SelectionError, SimulationError,
};
