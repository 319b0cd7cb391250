//! `engine` crate — the DAG runtime core: plan builder, node/step executor,
//! cooperative runner, layered environment, and condition evaluator
//! (spec.md §2 "System Overview").

pub mod condition;
pub mod env;
pub mod error;
pub mod node;
pub mod output;
pub mod plan;
pub mod runner;
pub mod step;
pub mod subdag;

pub use env::{Scope, StepMap, StepRef};
pub use error::Error;
pub use node::{Node, NodeState, RunContext, Status};
pub use plan::ExecutionPlan;
pub use runner::{DagStatus, EventHandlers, Metrics, RunOutcome, Runner};
pub use subdag::DagRegistry;
pub use step::{
    Action, CommandSpec, Condition, ContinueOn, ParallelConfig, ParallelSource, RepeatMode,
    RepeatPolicy, RetryPolicy, Step,
};
