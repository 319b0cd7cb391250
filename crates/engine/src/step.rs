//! Step data model (spec.md §3).
//!
//! A `Step` is the immutable, per-run input a [`crate::node::Node`] executes.
//! One of `Action::Command`, `Action::Script`, or `Action::SubDag` is the
//! primary action; `Action::Parallel` wraps a sub-DAG action with a fan-out
//! item source.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One command token, as parsed from a DAG definition (executable + args +
/// the raw unparsed line, kept so error messages can quote the original).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub executable: String,
    pub args: Vec<String>,
    pub raw: String,
}

/// The primary action a step performs. Exactly one variant per step
/// (spec.md §3: "exactly one form is the primary action").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Action {
    Commands(Vec<CommandSpec>),
    Script(String),
    SubDag { name: String, params: serde_json::Value },
}

/// Fan-out source for a `Parallel` step: a literal item list, or a variable
/// reference resolved (and parsed, spec.md §6) at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParallelSource {
    Items(Vec<serde_json::Value>),
    Variable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub source: ParallelSource,
    /// The sub-DAG name each expanded item is invoked against.
    pub sub_dag_name: String,
}

/// Policy governing whether, after a non-success terminal status, the plan
/// may still schedule this node's dependents (spec.md §4.2 "ShouldContinue").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinueOn {
    pub failure: bool,
    pub skipped: bool,
    pub exit_code: Vec<i32>,
    pub output: Vec<String>,
    pub mark_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub limit: u32,
    pub interval: Duration,
    /// Empty means "retry on any non-zero exit"; non-empty restricts retry
    /// to these exit codes (spec.md §4.2 "Retry loop").
    pub exit_codes: Vec<i32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { limit: 0, interval: Duration::from_secs(0), exit_codes: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatMode {
    While,
    Until,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatPolicy {
    pub mode: RepeatMode,
    pub interval: Duration,
    pub limit: Option<u32>,
    pub condition: Option<Condition>,
    pub exit_code: Vec<i32>,
}

/// A precondition, `continueOn` output-regex ancestor, or repeat/retry
/// predicate (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub condition: String,
    pub expected: Option<String>,
    pub negate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub id: Option<String>,
    pub depends: Vec<String>,
    pub action: Action,
    pub shell: Option<String>,
    pub shell_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub output: Option<String>,
    pub signal_on_stop: Option<String>,
    pub timeout: Option<Duration>,
    pub preconditions: Vec<Condition>,
    pub continue_on: ContinueOn,
    pub retry_policy: Option<RetryPolicy>,
    pub repeat_policy: Option<RepeatPolicy>,
    pub parallel: Option<ParallelConfig>,
}

impl Step {
    /// Construct a minimal step running a single shell command, for tests
    /// and the demo CLI's DAG loader. Everything else defaults to "unset".
    pub fn command(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            depends: Vec::new(),
            action: Action::Script(body.into()),
            shell: None,
            shell_args: Vec::new(),
            env: Vec::new(),
            dir: None,
            stdout: None,
            stderr: None,
            output: None,
            signal_on_stop: None,
            timeout: None,
            preconditions: Vec::new(),
            continue_on: ContinueOn::default(),
            retry_policy: None,
            repeat_policy: None,
            parallel: None,
        }
    }

    /// Construct a step whose primary action dispatches a named sub-DAG.
    pub fn sub_dag(name: impl Into<String>, dag_name: impl Into<String>, params: serde_json::Value) -> Self {
        let mut step = Self::command(name, "");
        step.action = Action::SubDag { name: dag_name.into(), params };
        step
    }

    /// Construct a step that fans out `source` into parallel sub-DAG runs
    /// against `dag_name` (spec.md §6 "Parallel expansion").
    pub fn parallel(name: impl Into<String>, dag_name: impl Into<String>, source: ParallelSource) -> Self {
        let mut step = Self::command(name, "");
        step.parallel = Some(ParallelConfig { source, sub_dag_name: dag_name.into() });
        step
    }

    pub fn depends_on(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_continue_on(mut self, continue_on: ContinueOn) -> Self {
        self.continue_on = continue_on;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry_policy = Some(retry);
        self
    }

    pub fn with_repeat(mut self, repeat: RepeatPolicy) -> Self {
        self.repeat_policy = Some(repeat);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_preconditions(mut self, preconditions: Vec<Condition>) -> Self {
        self.preconditions = preconditions;
        self
    }

    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.output = Some(name.into());
        self
    }

    /// Join `Commands` into a single `&&`-chained body; `Script` passes
    /// through unchanged. `SubDag` has no process body and panics if asked.
    pub fn process_body(&self) -> String {
        match &self.action {
            Action::Script(body) => body.clone(),
            Action::Commands(commands) => commands
                .iter()
                .map(|c| c.raw.as_str())
                .collect::<Vec<_>>()
                .join(" && "),
            Action::SubDag { .. } => {
                unreachable!("process_body called on a sub-DAG step")
            }
        }
    }
}
