//! `nodes` crate — the `StepExecutor` trait and its concrete variants.
//!
//! Every attempt at running a step — shell command, inline script, sub-DAG,
//! or parallel fan-out — goes through a [`StepExecutor`]. The engine crate
//! dispatches execution through this trait; `nodes` has no dependency back
//! on `engine` (sub-DAG recursion is injected via the `SubDagRunner`
//! callback trait instead).

pub mod error;
pub mod parallel;
pub mod process;
pub mod subdag;
pub mod traits;

pub use error::NodeError;
pub use traits::{ExecutorOutcome, OutputSinks, PidSlot, Signal, StepExecutor, SubDagOutcome};
