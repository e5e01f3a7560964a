//! Driver tiers, each building on the previous: [`base::DriverBase`] handles
//! registration and layout, [`parallel::ParallelEvalDriver`] adds dependency
//! graphs and the lazy evaluator, [`penalty::ExteriorPenaltyDriver`] adds the
//! augmented objective and the penalty-update state machine.

pub mod base;
pub mod parallel;
pub mod penalty;

pub use base::{Constraint, DriverBase, FailureMode, Objective, Sense};
pub use parallel::ParallelEvalDriver;
pub use penalty::{ExteriorPenaltyDriver, PenaltyParams};
