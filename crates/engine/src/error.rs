//! Engine error taxonomy (spec.md §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A condition predicate evaluated false.
    #[error("condition not met: {0}")]
    ConditionNotMet(String),

    /// Variable expansion or shell exec failed while evaluating a
    /// condition. Never inverted by `Negate` (spec.md §4.5).
    #[error("condition evaluation failed: {0}")]
    ConditionEvalFailed(String),

    /// A `Depends` entry names a step that doesn't exist.
    #[error("step not found: {0}")]
    StepNotFound(String),

    /// Kahn's algorithm didn't process every node.
    #[error("plan graph contains a cycle")]
    CyclicPlan,

    /// The runnable set is empty while non-terminal nodes remain.
    #[error("deadlock detected: no runnable nodes but {0} node(s) not terminal")]
    DeadlockDetected(usize),

    /// Step-level timeout elapsed; exit code is fixed at 124, no retry.
    #[error("step timed out after {0:?}")]
    StepTimeout(std::time::Duration),

    /// Captured stdout exceeded `MaxOutputSize`.
    #[error("output exceeded maximum size limit ({0} bytes)")]
    OutputExceededLimit(usize),

    /// Generic subprocess failure, carrying exit code and captured output.
    #[error("subprocess failed with exit code {exit_code}")]
    SubprocessFailed { exit_code: i32, stdout: String, stderr: String },

    /// Could not prepare the node (log dir, working dir, retry policy).
    #[error("setup failed: {0}")]
    SetupFailed(String),

    /// Wraps a lower-level executor error.
    #[error(transparent)]
    Executor(#[from] nodes::NodeError),

    /// Wraps a persistence-interface error.
    #[error(transparent)]
    Store(#[from] store::StoreError),
}
