//! Amount optimizer: drives the external simulation toward the real sensor
//! counts by adjusting the total generated trip amount.

pub mod control;
pub mod state;

pub use control::{AmountOptimizer, IterationRecord, OptimizationOutcome};
pub use state::{OptimizationState, RunState};
