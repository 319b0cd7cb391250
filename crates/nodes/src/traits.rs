//! `StepExecutor` — the contract every executor variant fulfils.
//!
//! A [`StepExecutor`] owns exactly one logical unit of work for a single
//! attempt of a node: a shell command/script, a sub-DAG invocation, or a
//! parallel fan-out of sub-DAG invocations. The engine's `Node` drives the
//! retry/repeat loop around it; the executor itself is single-shot.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::NodeError;

/// Either a real OS signal (for Unix process delivery) used by `kill`.
pub type Signal = nix::sys::signal::Signal;

/// Shared slot an executor publishes its child's OS pid into, as soon as it
/// has one. The engine's `Node` reads this (independently of whatever
/// `run()` future is in flight) to deliver signals — see spec.md §4.2
/// "Signal handling". Executors with no live OS process (sub-DAG, parallel
/// fan-out) simply never populate it, and a signal to them is a no-op.
pub type PidSlot = Arc<Mutex<Option<u32>>>;

/// How an attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOutcome {
    /// Process exit code, resolved the way spec.md §4.2 step 5 describes:
    /// `ExitCoder` first, then `ExitStatus`, then parsed from the error
    /// string, then -1 for `signal:`, then 1 as the default.
    pub exit_code: i32,
    /// Set when the outcome came from a delivered termination signal rather
    /// than a normal exit.
    pub terminated_by_signal: bool,
}

impl ExecutorOutcome {
    pub fn success() -> Self {
        Self { exit_code: 0, terminated_by_signal: false }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Where an executor writes captured stdout/stderr.
///
/// The engine supplies these; they fan out to the per-node log file, an
/// optional capped in-memory buffer for `Output` capture, and any configured
/// `continueOn.output` pattern scanner (see `engine::output`).
pub struct OutputSinks<'a> {
    pub stdout: &'a mut (dyn AsyncWrite + Unpin + Send),
    pub stderr: &'a mut (dyn AsyncWrite + Unpin + Send),
}

/// The core executor trait. Tagged variants implement this rather than a
/// deep inheritance hierarchy (spec.md §9 design note).
#[async_trait]
pub trait StepExecutor: Send {
    /// Run this attempt to completion, streaming output into `sinks`.
    ///
    /// Implementations that spawn an OS process must publish its pid into
    /// `pid_slot` immediately after spawning, so a concurrent `Signal` call
    /// (see `engine::node::Node::signal`) can reach it while this future is
    /// still in flight.
    async fn run(
        &mut self,
        sinks: OutputSinks<'_>,
        pid_slot: &PidSlot,
    ) -> Result<ExecutorOutcome, NodeError>;

    /// Release any resources (temp files, handles). Idempotent.
    async fn close(&mut self) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Deliver `sig` to the process tracked by `pid_slot`, if any.
pub fn signal_pid(pid_slot: &PidSlot, sig: Signal) -> Result<(), NodeError> {
    let pid = *pid_slot.lock().unwrap();
    if let Some(pid) = pid {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig)
            .map_err(NodeError::Signal)?;
    }
    Ok(())
}

/// Outcome of a single sub-DAG invocation, reported back by a
/// [`crate::subdag::SubDagRunner`].
#[derive(Debug, Clone)]
pub struct SubDagOutcome {
    pub run_id: String,
    pub succeeded: bool,
    pub exit_code: i32,
    /// Captured output of the sub-DAG's own terminal node, if any.
    pub output: Option<serde_json::Value>,
}
