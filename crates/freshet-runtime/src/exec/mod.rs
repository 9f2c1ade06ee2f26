//! Box execution: expression evaluation, windows, emitters and the
//! compiled select pipeline.

pub mod emitter;
pub mod evaluator;
pub mod plan;
pub mod window;

pub use emitter::{EmitterState, OutputRow};
pub use evaluator::{eval, fold_expr, RowContext};
pub use plan::{BoxWriter, SelectPlan};
pub use window::Window;
