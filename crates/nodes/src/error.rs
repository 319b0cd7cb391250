//! Executor-level error type.

use thiserror::Error;

/// Errors returned by a [`crate::StepExecutor`].
///
/// The engine's retry/repeat loop derives an exit code from these; the
/// variants exist so the underlying cause survives into logs and into
/// `NodeState.error`.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The subprocess could not even be spawned (missing binary, bad cwd, …).
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    /// I/O error while streaming stdout/stderr or waiting on the child.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Sending a signal to the child process failed.
    #[error("failed to signal process: {0}")]
    Signal(#[source] nix::errno::Errno),

    /// A sub-DAG invocation failed; the message carries the child's own error.
    #[error("sub-dag '{name}' failed: {message}")]
    SubDagFailed { name: String, message: String },

    /// Parallel expansion could not resolve its item source.
    #[error("parallel expansion failed: {0}")]
    ParallelExpansion(String),
}
