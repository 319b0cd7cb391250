//! Node: the live pairing of a [`Step`] and its [`NodeState`] for one run
//! (spec.md §3, §4.2).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use nodes::{
    process::{ProcessExecutor, ProcessSpec},
    traits::signal_pid,
    subdag::{canonical_json, SubDagExecutor, SubDagRunner},
    parallel::{expand_items, parse_items, ParallelExecutor},
    ExecutorOutcome, OutputSinks, PidSlot, Signal, StepExecutor,
};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};

use crate::env::Scope;
use crate::error::Error;
use crate::output::{default_log_paths, merged_log_path, OutputCoordinator, DEFAULT_MAX_OUTPUT_SIZE};
use crate::step::{Action, ParallelSource, RepeatMode, Step};

/// A node's status (spec.md §3 `NodeState.Status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Skipped,
    PartiallySucceeded,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::NotStarted | Status::Running)
    }
}

/// Per-execution mutable state (spec.md §3 `NodeState`).
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub status: Status,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retried_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub done_count: u32,
    pub repeated: bool,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub output_variables: HashMap<String, String>,
    pub sub_runs: Vec<String>,
    pub sub_runs_repeated: Vec<String>,
    pub parallel_items: Vec<serde_json::Value>,
    /// Whether `ContinueOn.Output` matched this attempt's captured log —
    /// computed while the `OutputCoordinator` is still alive, since
    /// `should_continue` is evaluated long after the attempt's sinks are
    /// gone.
    pub output_pattern_matched: bool,
}

/// Everything a [`Node`] needs to know about the run it belongs to, beyond
/// its own `Step` (spec.md §4.2 `Prepare(ctx, logDir, dagRunID)`).
pub struct RunContext {
    pub dag_run_id: String,
    pub dag_name: String,
    pub log_dir: PathBuf,
    pub dag_working_dir: Option<PathBuf>,
    pub dag_shell: Option<String>,
    pub max_output_size: usize,
    pub sub_dag_runner: Option<Arc<dyn SubDagRunner>>,
    pub signal_grace: std::time::Duration,
}

impl RunContext {
    pub fn new(dag_run_id: impl Into<String>, log_dir: PathBuf) -> Self {
        Self {
            dag_run_id: dag_run_id.into(),
            dag_name: String::new(),
            log_dir,
            dag_working_dir: None,
            dag_shell: None,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            sub_dag_runner: None,
            signal_grace: std::time::Duration::from_secs(3),
        }
    }

    pub fn with_dag_name(mut self, name: impl Into<String>) -> Self {
        self.dag_name = name.into();
        self
    }

    /// The whole-run log file path (spec.md §6 `DAG_RUN_LOG_FILE`),
    /// distinct from any individual step's stdout/stderr log.
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.dag_run_id))
    }
}

/// The live pairing of a [`Step`] and its [`NodeState`] for one run.
/// Owns its own mutex; all mutations go through typed accessors (spec.md §3
/// `Node`).
#[derive(Debug)]
pub struct Node {
    pub id: u64,
    pub step: Step,
    state: Mutex<NodeState>,
    pid_slot: PidSlot,
    should_continue_cache: Mutex<Option<bool>>,
    torn_down: AtomicBool,
}

impl Node {
    pub fn new(id: u64, step: Step) -> Self {
        Self {
            id,
            step,
            state: Mutex::new(NodeState::default()),
            pid_slot: Arc::new(Mutex::new(None)),
            should_continue_cache: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    pub fn set_status(&self, status: Status) {
        self.state.lock().unwrap().status = status;
    }

    pub fn snapshot(&self) -> NodeState {
        self.state.lock().unwrap().clone()
    }

    /// Reset state to fresh `NotStarted`, keeping the node's id and step
    /// (spec.md §4.1 "Reset means: `State ← NodeState{}`").
    pub fn reset(&self) {
        *self.state.lock().unwrap() = NodeState::default();
        *self.should_continue_cache.lock().unwrap() = None;
        self.torn_down.store(false, Ordering::SeqCst);
    }

    /// Carry a prior run's full `NodeState` forward onto this node (spec.md
    /// §4.1 "preserves existing node states" for `CreateRetryPlan`/
    /// `CreateStepRetryPlan`) — not just its `Status`, so output variables
    /// and log paths a preserved `Succeeded`/`Skipped` node produced remain
    /// resolvable by downstream steps on retry.
    pub fn restore(&self, state: NodeState) {
        *self.state.lock().unwrap() = state;
        *self.should_continue_cache.lock().unwrap() = None;
    }

    /// Resolve log paths and create the log directory (spec.md §4.2
    /// `Prepare` steps 1-2).
    pub async fn prepare(&self, ctx: &RunContext) -> Result<(), Error> {
        OutputCoordinator::ensure_log_dir(&ctx.log_dir).await?;
        let timestamp = Utc::now().format("%Y%m%d.%H%M%S%.3f").to_string();

        let (stdout, stderr) = if self.step.stdout.is_some() && self.step.stdout == self.step.stderr {
            let merged = merged_log_path(&ctx.log_dir, &self.step.name, &timestamp, &ctx.dag_run_id);
            (merged.clone(), merged)
        } else {
            default_log_paths(&ctx.log_dir, &self.step.name, &timestamp, &ctx.dag_run_id)
        };

        let mut state = self.state.lock().unwrap();
        state.stdout = Some(stdout);
        state.stderr = Some(stderr);
        Ok(())
    }

    /// Evaluate this step's preconditions, if any (spec.md §4.3 "for each
    /// scheduled node: Prepare, evaluate preconditions ... then Execute").
    /// Marks the node `Skipped` and returns `false` on the first failing
    /// condition; callers must not call `run` when this returns `false`.
    pub async fn evaluate_preconditions(&self, ctx: &RunContext, base_scope: &Scope) -> Result<bool, Error> {
        if self.step.preconditions.is_empty() {
            return Ok(true);
        }
        let scope = self.build_scope(ctx, base_scope)?;
        if crate::condition::eval_conditions(&self.step.preconditions, &scope).await.is_err() {
            self.set_status(Status::Skipped);
            return Ok(false);
        }
        Ok(true)
    }

    /// Build this node's [`Scope`] for one attempt: step env plus the
    /// synthesised variables spec.md §4.4 names, layered over everything
    /// the caller already collected from upstream/secrets/DAG/OS.
    fn build_scope(&self, ctx: &RunContext, base: &Scope) -> Result<Scope, Error> {
        let mut scope = base.clone();
        let state = self.state.lock().unwrap();
        let mut entries = self.step.env.clone();
        entries.push(("DAG_RUN_ID".into(), ctx.dag_run_id.clone()));
        entries.push(("DAG_NAME".into(), ctx.dag_name.clone()));
        entries.push(("DAG_RUN_LOG_FILE".into(), ctx.log_file().display().to_string()));
        entries.push(("DAG_RUN_STEP_NAME".into(), self.step.name.clone()));
        if let Some(stdout) = &state.stdout {
            entries.push(("DAG_RUN_STEP_STDOUT_FILE".into(), stdout.display().to_string()));
        }
        if let Some(stderr) = &state.stderr {
            entries.push(("DAG_RUN_STEP_STDERR_FILE".into(), stderr.display().to_string()));
        }
        drop(state);
        scope.with_entries(entries);
        if let Some(shell) = &self.step.shell {
            scope.shell = shell.clone();
        } else if let Some(dag_shell) = &ctx.dag_shell {
            scope.shell = dag_shell.clone();
        }
        if !self.step.shell_args.is_empty() {
            scope.shell_args = self.step.shell_args.clone();
        }
        Ok(scope)
    }

    /// One attempt: precondition check happens in the runner before this is
    /// called. Executes the step's action exactly once (spec.md §4.2
    /// `Execute` steps 1-7) and records the outcome into `NodeState`.
    async fn execute_once(&self, ctx: &RunContext, scope: &Scope) -> Result<(), Error> {
        let dir = crate::env::resolve_working_dir(self.step.dir.as_deref(), ctx.dag_working_dir.as_deref())?;
        let mut entries = scope.materialize();
        entries.push(("PWD".into(), dir.display().to_string()));

        let (stdout_path, stderr_path) = {
            let state = self.state.lock().unwrap();
            (state.stdout.clone().expect("prepare sets stdout"), state.stderr.clone().expect("prepare sets stderr"))
        };
        let coordinator = OutputCoordinator::new(stdout_path, stderr_path, ctx.max_output_size);
        let (mut stdout_writer, mut stderr_writer) = coordinator.open().await?;

        let mut executor = self.build_executor(ctx, scope, entries, dir).await?;

        let run_future = executor.run(
            OutputSinks { stdout: &mut stdout_writer, stderr: &mut stderr_writer },
            &self.pid_slot,
        );

        let outcome = match self.step.timeout {
            Some(duration) => match timeout(duration, run_future).await {
                Ok(result) => result,
                Err(_) => {
                    let mut state = self.state.lock().unwrap();
                    state.exit_code = Some(124);
                    state.status = Status::Failed;
                    state.error = Some(format!("step timed out after {duration:?}"));
                    state.done_count += 1;
                    return Err(Error::StepTimeout(duration));
                }
            },
            None => run_future.await,
        };
        let _ = executor.close().await;

        let mut state = self.state.lock().unwrap();
        state.done_count += 1;

        match outcome {
            Ok(ExecutorOutcome { exit_code, .. }) => {
                state.exit_code = Some(exit_code);
                if exit_code == 0 {
                    state.status = Status::Succeeded;
                    state.error = None;
                } else {
                    state.status = Status::Failed;
                    state.error = Some(format!("exit status {exit_code}"));
                }
            }
            Err(e) => {
                state.exit_code = Some(1);
                state.status = Status::Failed;
                state.error = Some(e.to_string());
            }
        }
        drop(state);

        if let Some(output_name) = &self.step.output {
            let captured = coordinator.captured_stdout()?;
            let mut state = self.state.lock().unwrap();
            state.output_variables.insert(output_name.clone(), captured.trim_end_matches('\n').to_string());
        }

        if !self.step.continue_on.output.is_empty() {
            let matched = coordinator.matches_output_pattern(&self.step.continue_on.output);
            self.state.lock().unwrap().output_pattern_matched = matched;
        }

        Ok(())
    }

    async fn build_executor(
        &self,
        ctx: &RunContext,
        scope: &Scope,
        env: Vec<(String, String)>,
        dir: PathBuf,
    ) -> Result<Box<dyn StepExecutor>, Error> {
        match &self.step.action {
            Action::Script(_) | Action::Commands(_) => {
                let body = scope.expand(&self.step.process_body()).await?;
                Ok(Box::new(ProcessExecutor::new(ProcessSpec {
                    shell: scope.shell.clone(),
                    shell_args: scope.shell_args.clone(),
                    body,
                    env,
                    dir,
                })))
            }
            Action::SubDag { name, params } => {
                let runner = ctx
                    .sub_dag_runner
                    .clone()
                    .ok_or_else(|| Error::SetupFailed("no sub-dag runner configured".into()))?;
                Ok(Box::new(SubDagExecutor::new(
                    runner,
                    name.clone(),
                    params.clone(),
                    ctx.dag_run_id.clone(),
                    self.step.name.clone(),
                    None,
                )))
            }
        }
    }

    /// Run the full retry/repeat loop around a single logical execution
    /// (spec.md §4.2 "Retry loop", "Repeat loop").
    pub async fn run(&self, ctx: &RunContext, base_scope: &Scope) -> Result<(), Error> {
        self.state.lock().unwrap().started_at = Some(Utc::now());
        self.set_status(Status::Running);

        if let Some(parallel) = &self.step.parallel {
            let result = self.run_parallel(ctx, base_scope, parallel).await;
            self.state.lock().unwrap().finished_at = Some(Utc::now());
            return result;
        }

        let mut iteration: u32 = 0;
        loop {
            let scope = self.build_scope(ctx, base_scope)?;
            self.run_with_retries(ctx, &scope).await;

            let repeat_policy = match &self.step.repeat_policy {
                Some(p) => p.clone(),
                None => break,
            };
            if let Some(limit) = repeat_policy.limit {
                if iteration + 1 >= limit {
                    break;
                }
            }

            let satisfied = self.repeat_condition_satisfied(&repeat_policy, &scope).await?;
            let should_continue_loop = match repeat_policy.mode {
                RepeatMode::While => satisfied,
                RepeatMode::Until => !satisfied,
            };
            if !should_continue_loop {
                break;
            }

            iteration += 1;
            self.state.lock().unwrap().repeated = true;
            sleep(repeat_policy.interval).await;

            // Re-export this node's own captured output so the next
            // iteration's condition sees the latest value (spec.md §4.2
            // "Before each iteration the captured output variables ...").
            let exports: Vec<(String, String)> =
                self.state.lock().unwrap().output_variables.clone().into_iter().collect();
            let mut rebuilt = base_scope.clone();
            rebuilt.with_entries(exports);
            *self.should_continue_cache.lock().unwrap() = None;
        }

        self.state.lock().unwrap().finished_at = Some(Utc::now());
        Ok(())
    }

    async fn repeat_condition_satisfied(
        &self,
        policy: &crate::step::RepeatPolicy,
        scope: &Scope,
    ) -> Result<bool, Error> {
        if let Some(condition) = &policy.condition {
            return Ok(crate::condition::evaluate(condition, scope).await.is_ok());
        }
        if !policy.exit_code.is_empty() {
            let exit_code = self.state.lock().unwrap().exit_code.unwrap_or(1);
            return Ok(policy.exit_code.contains(&exit_code));
        }
        Ok(self.status() == Status::Succeeded)
    }

    async fn run_with_retries(&self, ctx: &RunContext, scope: &Scope) {
        loop {
            if self.execute_once(ctx, scope).await.is_err() {
                // Timeout: execute_once already set terminal Failed state and
                // short-circuits retry (spec.md §4.2 "Timeout failures
                // short-circuit retry").
                return;
            }

            if self.status() != Status::Failed {
                return;
            }

            let policy = match &self.step.retry_policy {
                Some(p) => p.clone(),
                None => return,
            };

            let retry_count = self.state.lock().unwrap().retry_count;
            if retry_count >= policy.limit {
                return;
            }
            let exit_code = self.state.lock().unwrap().exit_code.unwrap_or(1);
            let eligible = if policy.exit_codes.is_empty() {
                exit_code != 0
            } else {
                policy.exit_codes.contains(&exit_code)
            };
            if !eligible {
                return;
            }

            sleep(policy.interval).await;
            let mut state = self.state.lock().unwrap();
            state.retry_count += 1;
            state.retried_at = Some(Utc::now());
            state.error = None;
            state.status = Status::NotStarted;
            drop(state);
        }
    }

    async fn run_parallel(
        &self,
        ctx: &RunContext,
        scope: &Scope,
        parallel: &crate::step::ParallelConfig,
    ) -> Result<(), Error> {
        let runner = ctx
            .sub_dag_runner
            .clone()
            .ok_or_else(|| Error::SetupFailed("no sub-dag runner configured".into()))?;

        let raw_items = match &parallel.source {
            ParallelSource::Items(items) => items.clone(),
            ParallelSource::Variable(var) => {
                let resolved = scope.expand(&format!("${{{var}}}")).await?;
                parse_items(&resolved)
            }
        };

        let expanded = expand_items(raw_items, &ctx.dag_run_id, &self.step.name);
        self.state.lock().unwrap().parallel_items = expanded.iter().map(|(_, v)| v.clone()).collect();

        let mut executor = ParallelExecutor::new(runner, parallel.sub_dag_name.clone(), expanded.clone());
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let outcome = executor
            .run(OutputSinks { stdout: &mut stdout, stderr: &mut stderr }, &self.pid_slot)
            .await;

        let mut state = self.state.lock().unwrap();
        state.done_count += 1;
        state.sub_runs = expanded.into_iter().map(|(id, _)| id).collect();
        match outcome {
            Ok(ExecutorOutcome { exit_code, .. }) => {
                state.exit_code = Some(exit_code);
                state.status = if exit_code == 0 { Status::Succeeded } else { Status::Failed };
            }
            Err(e) => {
                state.exit_code = Some(1);
                state.status = Status::Failed;
                state.error = Some(e.to_string());
            }
        }
        Ok(())
    }

    /// The canonical JSON param string for this node's sub-DAG action, if
    /// any — used by callers computing a deterministic sub-run id.
    pub fn sub_dag_params(&self) -> Option<String> {
        match &self.step.action {
            Action::SubDag { params, .. } => Some(canonical_json(params)),
            _ => None,
        }
    }

    /// Downstream-scheduling gate (spec.md §4.2 "ShouldContinue"). Cached
    /// per attempt so repeated calls don't re-scan log files.
    pub fn should_continue(&self) -> bool {
        if let Some(cached) = *self.should_continue_cache.lock().unwrap() {
            return cached;
        }
        let status = self.status();
        let continue_on = &self.step.continue_on;
        let state = self.state.lock().unwrap();
        let exit_code = state.exit_code;
        let output_matched = state.output_pattern_matched;
        drop(state);

        let result = match status {
            Status::Succeeded | Status::PartiallySucceeded => true,
            Status::Aborted => false,
            Status::Failed => {
                continue_on.failure
                    || exit_code.map(|c| continue_on.exit_code.contains(&c)).unwrap_or(false)
                    || output_matched
            }
            Status::Skipped => continue_on.skipped,
            _ => false,
        };

        *self.should_continue_cache.lock().unwrap() = Some(result);
        result
    }

    /// `true` iff `should_continue` and `ContinueOn.MarkSuccess` — the
    /// runner uses this to upgrade a `Failed` node to `Succeeded` (spec.md
    /// §4.2 "ShouldMarkSuccess").
    pub fn should_mark_success(&self) -> bool {
        self.should_continue() && self.step.continue_on.mark_success
    }

    /// Deliver `sig` (or the step's `SignalOnStop` override) to the live
    /// subprocess, transitioning to `Aborted` if it's a termination signal
    /// (spec.md §4.2 "Signal handling").
    pub fn signal(&self, sig: Signal, allow_override: bool) -> Result<(), Error> {
        if self.status() != Status::Running {
            return Ok(());
        }
        let effective = if allow_override {
            self.step
                .signal_on_stop
                .as_deref()
                .and_then(parse_signal_name)
                .unwrap_or(sig)
        } else {
            sig
        };
        signal_pid(&self.pid_slot, effective).map_err(Error::Executor)?;
        if is_termination_signal(effective) {
            self.set_status(Status::Aborted);
        }
        Ok(())
    }

    /// The terminationless variant of `signal`: mark `Aborted` without
    /// sending anything (spec.md §4.2 "`Cancel()`").
    pub fn cancel(&self) {
        if self.status() == Status::Running || self.status() == Status::NotStarted {
            self.set_status(Status::Aborted);
        }
    }

    /// Idempotent teardown: `CompareAndSwap(false, true)` so a second call
    /// is a no-op (spec.md §4.2 "Lifecycle", §5 "Resource release").
    pub fn teardown(&self) {
        let _ = self.torn_down.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

fn is_termination_signal(sig: Signal) -> bool {
    matches!(sig, Signal::SIGTERM | Signal::SIGKILL | Signal::SIGINT | Signal::SIGHUP)
}

fn parse_signal_name(name: &str) -> Option<Signal> {
    match name.to_ascii_uppercase().trim_start_matches("SIG") {
        "TERM" => Some(Signal::SIGTERM),
        "KILL" => Some(Signal::SIGKILL),
        "INT" => Some(Signal::SIGINT),
        "HUP" => Some(Signal::SIGHUP),
        "USR1" => Some(Signal::SIGUSR1),
        "USR2" => Some(Signal::SIGUSR2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Scope, StepMap};
    use crate::step::{ContinueOn, RetryPolicy, Step};
    use std::collections::HashMap as Map;
    use std::time::Duration;

    fn ctx(dir: &tempfile::TempDir) -> RunContext {
        RunContext::new("deadbeefcafef00d", dir.path().to_path_buf())
    }

    fn scope() -> Scope {
        Scope::new(vec![], Map::new(), Map::new(), vec![], StepMap::new(), "sh".into(), vec!["-c".into()])
    }

    #[tokio::test]
    async fn successful_step_transitions_to_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(0, Step::command("a", "true"));
        let run_ctx = ctx(&dir);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();
        assert_eq!(node.status(), Status::Succeeded);
        assert_eq!(node.snapshot().exit_code, Some(0));
    }

    #[tokio::test]
    async fn failing_step_transitions_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(0, Step::command("a", "exit 3"));
        let run_ctx = ctx(&dir);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();
        assert_eq!(node.status(), Status::Failed);
        assert_eq!(node.snapshot().exit_code, Some(3));
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let body = format!(
            "if [ -f {0} ]; then exit 0; else touch {0}; exit 1; fi",
            marker.display()
        );
        let step = Step::command("r", body).with_retry(RetryPolicy {
            limit: 2,
            interval: Duration::from_millis(5),
            exit_codes: vec![],
        });
        let node = Node::new(0, step);
        let run_ctx = ctx(&dir);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();
        assert_eq!(node.status(), Status::Succeeded);
        let snap = node.snapshot();
        assert_eq!(snap.retry_count, 1);
        assert_eq!(snap.done_count, 2);
    }

    #[tokio::test]
    async fn step_timeout_fails_with_exit_code_124_and_no_retry() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::command("x", "sleep 1")
            .with_timeout(Duration::from_millis(100))
            .with_retry(RetryPolicy { limit: 5, interval: Duration::from_millis(1), exit_codes: vec![] });
        let node = Node::new(0, step);
        let run_ctx = ctx(&dir);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();
        assert_eq!(node.status(), Status::Failed);
        let snap = node.snapshot();
        assert_eq!(snap.exit_code, Some(124));
        assert_eq!(snap.retry_count, 0);
        assert!(snap.error.unwrap().contains("step timed out"));
    }

    #[tokio::test]
    async fn continue_on_failure_allows_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::command("b", "exit 1")
            .with_continue_on(ContinueOn { failure: true, ..Default::default() });
        let node = Node::new(0, step);
        let run_ctx = ctx(&dir);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();
        assert_eq!(node.status(), Status::Failed);
        assert!(node.should_continue());
    }

    #[tokio::test]
    async fn output_capture_binds_variable() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::command("o", "echo captured").with_output("RESULT");
        let node = Node::new(0, step);
        let run_ctx = ctx(&dir);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();
        assert_eq!(node.snapshot().output_variables.get("RESULT").unwrap(), "captured");
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let node = Node::new(0, Step::command("a", "true"));
        node.teardown();
        assert!(node.is_torn_down());
        node.teardown();
        assert!(node.is_torn_down());
    }

    #[tokio::test]
    async fn repeat_until_condition_stops_once_file_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("F");

        let target_writer = target.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            tokio::fs::write(&target_writer, "ready").await.unwrap();
        });

        let step = Step::command("p", format!("cat {} || echo notfound", target.display())).with_repeat(
            crate::step::RepeatPolicy {
                mode: crate::step::RepeatMode::Until,
                interval: Duration::from_millis(20),
                limit: None,
                condition: Some(crate::step::Condition {
                    condition: format!("`cat {}`", target.display()),
                    expected: Some("ready".into()),
                    negate: false,
                }),
                exit_code: vec![],
            },
        );

        let run_ctx = ctx(&dir);
        let node = Node::new(0, step);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();

        assert_eq!(node.status(), Status::Succeeded);
        assert!(node.snapshot().done_count >= 2);
    }

    #[tokio::test]
    async fn sub_dag_step_runs_through_a_registered_dag_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = std::sync::Arc::new(crate::subdag::DagRegistry::new(dir.path().to_path_buf()));
        registry.register("child", vec![Step::command("only", "exit 0").with_output("X")]);

        let mut run_ctx = ctx(&dir);
        run_ctx.sub_dag_runner = Some(registry);

        let node = Node::new(0, Step::sub_dag("launch", "child", serde_json::json!({})));
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();

        assert_eq!(node.status(), Status::Succeeded);
        assert_eq!(node.snapshot().exit_code, Some(0));
    }

    #[tokio::test]
    async fn parallel_step_fans_out_over_items_and_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let registry = std::sync::Arc::new(crate::subdag::DagRegistry::new(dir.path().to_path_buf()));
        registry.register("child", vec![Step::command("only", "true")]);

        let mut run_ctx = ctx(&dir);
        run_ctx.sub_dag_runner = Some(registry);

        let step = Step::parallel(
            "fanout",
            "child",
            crate::step::ParallelSource::Items(vec![
                serde_json::json!({"n": 1}),
                serde_json::json!({"n": 2}),
                serde_json::json!({"n": 3}),
            ]),
        );
        let node = Node::new(0, step);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();

        assert_eq!(node.status(), Status::Succeeded);
        assert_eq!(node.snapshot().sub_runs.len(), 3);
    }

    #[tokio::test]
    async fn parallel_step_fails_when_any_sub_dag_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = std::sync::Arc::new(crate::subdag::DagRegistry::new(dir.path().to_path_buf()));
        registry.register("child", vec![Step::command("only", "exit 1")]);

        let mut run_ctx = ctx(&dir);
        run_ctx.sub_dag_runner = Some(registry);

        let step = Step::parallel(
            "fanout",
            "child",
            crate::step::ParallelSource::Items(vec![serde_json::json!({"n": 1})]),
        );
        let node = Node::new(0, step);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();

        assert_eq!(node.status(), Status::Failed);
    }

    #[tokio::test]
    async fn dag_level_env_vars_are_visible_to_a_step() {
        let dir = tempfile::tempdir().unwrap();
        let run_ctx = ctx(&dir).with_dag_name("my-dag");
        let step = Step::command("a", "echo $DAG_RUN_ID:$DAG_NAME:$DAG_RUN_LOG_FILE").with_output("OUT");
        let node = Node::new(0, step);
        node.prepare(&run_ctx).await.unwrap();
        node.run(&run_ctx, &scope()).await.unwrap();

        assert_eq!(node.status(), Status::Succeeded);
        let out = node.snapshot().output_variables.get("OUT").unwrap().clone();
        let expected_log_file = run_ctx.log_file().display().to_string();
        assert_eq!(out, format!("deadbeefcafef00d:my-dag:{expected_log_file}"));
    }

    #[tokio::test]
    async fn precondition_failure_is_reported_as_condition_not_met() {
        let dir = tempfile::tempdir().unwrap();
        let run_ctx = ctx(&dir);
        let step = Step::command("a", "true").with_preconditions(vec![crate::step::Condition {
            condition: "false".to_string(),
            expected: None,
            negate: false,
        }]);
        let node = Node::new(0, step);
        node.prepare(&run_ctx).await.unwrap();
        let proceed = node.evaluate_preconditions(&run_ctx, &scope()).await.unwrap();
        assert!(!proceed);
        assert_eq!(node.status(), Status::Skipped);
    }
}
