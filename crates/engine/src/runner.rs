//! Runner: cooperative scheduler over an [`ExecutionPlan`] (spec.md §4.3).

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use nodes::Signal;
use tokio::sync::Semaphore;

use crate::condition::eval_conditions;
use crate::env::{Scope, StepRef};
use crate::error::Error;
use crate::node::{Node, RunContext, Status};
use crate::plan::ExecutionPlan;
use crate::step::{Condition, Step};

/// Final status of a dag-run (spec.md §4.3 "Determine final DAG status").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagStatus {
    Succeeded,
    Failed,
    Aborted,
    PartiallySucceeded,
}

/// Counters exposed by the runner (spec.md §4.3 "Metrics").
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
    pub canceled_nodes: usize,
    pub total_execution_time: Duration,
}

/// The four optional lifecycle callbacks (spec.md §4.3 "Event handlers").
#[derive(Default)]
pub struct EventHandlers {
    pub on_success: Option<Step>,
    pub on_failure: Option<Step>,
    pub on_cancel: Option<Step>,
    pub on_exit: Option<Step>,
}

pub struct RunOutcome {
    pub status: DagStatus,
    pub metrics: Metrics,
}

/// Cooperative scheduler: walks the plan respecting dependencies, enforces
/// a concurrency cap, drives event handlers, and aggregates final status.
pub struct Runner {
    max_active_steps: usize,
    signal_grace: Duration,
}

impl Runner {
    pub fn new(max_active_steps: usize) -> Self {
        Self { max_active_steps, signal_grace: Duration::from_secs(3) }
    }

    pub fn with_signal_grace(mut self, grace: Duration) -> Self {
        self.signal_grace = grace;
        self
    }

    /// `Run(ctx, plan, progressChan?)` (spec.md §4.3). DAG-level
    /// preconditions gate the whole run; a bounded worker pool schedules
    /// nodes whose dependencies are all terminal and `ShouldContinue`.
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        run_ctx: &RunContext,
        base_scope: &Scope,
        dag_preconditions: &[Condition],
        handlers: Option<&EventHandlers>,
        progress: Option<&tokio::sync::mpsc::UnboundedSender<Arc<Node>>>,
    ) -> Result<RunOutcome, Error> {
        plan.mark_started();
        let nodes = plan.nodes();
        let mut metrics = Metrics { total_nodes: nodes.len(), ..Default::default() };

        if !dag_preconditions.is_empty() && eval_conditions(dag_preconditions, base_scope).await.is_err() {
            for node in &nodes {
                node.cancel();
            }
            plan.finish();
            self.run_handler(handlers.and_then(|h| h.on_cancel.as_ref()), run_ctx, base_scope, &nodes).await?;
            self.run_handler(handlers.and_then(|h| h.on_exit.as_ref()), run_ctx, base_scope, &nodes).await?;
            return Ok(RunOutcome { status: DagStatus::Aborted, metrics });
        }

        let permits = if self.max_active_steps == 0 { nodes.len().max(1) } else { self.max_active_steps };
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut scheduled: HashSet<u64> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();
        let aborted_sweep = Arc::new(std::sync::atomic::AtomicBool::new(false));

        loop {
            // Cascading skip: a node whose dependency is `Skipped` and that
            // dependency's `ShouldContinue` is false propagates the skip,
            // unless this node itself has `ContinueOn.Skipped` (spec.md
            // §4.3 "propagate as skip dependents unless a dependent has
            // ContinueOn.Skipped").
            for node in &nodes {
                if node.status() != Status::NotStarted || scheduled.contains(&node.id) {
                    continue;
                }
                let deps: Vec<_> = plan
                    .dependencies(node.id)
                    .into_iter()
                    .map(|id| plan.get_node_by_id(id).unwrap())
                    .collect();
                if !deps.iter().all(|d| d.status().is_terminal()) {
                    continue;
                }
                let blocked = deps.iter().any(|d| d.status() == Status::Skipped && !d.should_continue());
                if blocked {
                    node.set_status(Status::Skipped);
                    continue;
                }
                if deps.iter().all(|d| d.should_continue()) {
                    scheduled.insert(node.id);
                    in_flight.push(self.spawn_node(
                        node.clone(),
                        run_ctx.clone_for_spawn(),
                        base_scope.clone(),
                        semaphore.clone(),
                    ));
                }
            }

            if in_flight.is_empty() {
                let unresolved: Vec<_> = nodes.iter().filter(|n| n.status() == Status::NotStarted).collect();
                if unresolved.is_empty() {
                    break;
                }
                return Err(Error::DeadlockDetected(unresolved.len()));
            }

            if let Some(result) = in_flight.next().await {
                let node_id = result.expect("node task panicked");
                let node = plan.get_node_by_id(node_id).unwrap();
                if node.status() == Status::Failed && node.should_mark_success() {
                    node.set_status(Status::Succeeded);
                }
                if node.status() == Status::Failed && !node.should_continue() && !aborted_sweep.load(Ordering::SeqCst) {
                    aborted_sweep.store(true, Ordering::SeqCst);
                    for other in &nodes {
                        if other.status() == Status::NotStarted {
                            other.cancel();
                        }
                    }
                }
                if let Some(tx) = progress {
                    let _ = tx.send(node);
                }
            }
        }

        plan.finish();

        for node in &nodes {
            let snap = node.snapshot();
            match node.status() {
                Status::Succeeded | Status::PartiallySucceeded => metrics.completed_nodes += 1,
                Status::Failed => metrics.failed_nodes += 1,
                Status::Skipped => metrics.skipped_nodes += 1,
                Status::Aborted => metrics.canceled_nodes += 1,
                _ => {}
            }
            if let (Some(start), Some(end)) = (snap.started_at, snap.finished_at) {
                if let Ok(duration) = (end - start).to_std() {
                    metrics.total_execution_time += duration;
                }
            }
        }

        let status = derive_dag_status(&nodes);

        match status {
            DagStatus::Succeeded | DagStatus::PartiallySucceeded => {
                self.run_handler(handlers.and_then(|h| h.on_success.as_ref()), run_ctx, base_scope, &nodes).await?;
            }
            DagStatus::Failed => {
                self.run_handler(handlers.and_then(|h| h.on_failure.as_ref()), run_ctx, base_scope, &nodes).await?;
            }
            DagStatus::Aborted => {
                self.run_handler(handlers.and_then(|h| h.on_cancel.as_ref()), run_ctx, base_scope, &nodes).await?;
            }
        }
        self.run_handler(handlers.and_then(|h| h.on_exit.as_ref()), run_ctx, base_scope, &nodes).await?;

        Ok(RunOutcome { status, metrics })
    }

    fn spawn_node(
        &self,
        node: Arc<Node>,
        run_ctx: RunContext,
        base_scope: Scope,
        semaphore: Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<u64> {
        tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let id = node.id;
            match node.prepare(&run_ctx).await {
                Ok(()) => match node.evaluate_preconditions(&run_ctx, &base_scope).await {
                    Ok(true) => {
                        node.run(&run_ctx, &base_scope).await.ok();
                    }
                    Ok(false) => {}
                    Err(_) => node.set_status(Status::Failed),
                },
                Err(_) => node.set_status(Status::Failed),
            }

            let snap = node.snapshot();
            if let (Some(stdout), Some(stderr)) = (snap.stdout.clone(), snap.stderr.clone()) {
                let step_id = node.step.id.clone().unwrap_or_else(|| node.step.name.clone());
                base_scope.step_map().publish(
                    &step_id,
                    StepRef { stdout, stderr, exit_code: snap.exit_code.unwrap_or(-1) },
                );
            }

            node.teardown();
            id
        })
    }

    /// Run a single handler step as its own one-node plan (spec.md §4.3
    /// "Event handlers" 3). `DAG_RUN_STATUS` is added to its scope; it may
    /// reference main steps' ids via `${id.stdout|stderr|exit_code}` since
    /// it shares the caller's `base_scope` (and thus `StepMap`).
    async fn run_handler(
        &self,
        step: Option<&Step>,
        run_ctx: &RunContext,
        base_scope: &Scope,
        main_nodes: &[Arc<Node>],
    ) -> Result<(), Error> {
        let Some(step) = step else { return Ok(()) };
        let status = derive_dag_status(main_nodes);
        let mut scope = base_scope.clone();
        scope.with_entries(vec![("DAG_RUN_STATUS".to_string(), format!("{status:?}"))]);

        let node = Arc::new(Node::new(u64::MAX, step.clone()));
        node.prepare(run_ctx).await?;
        node.run(run_ctx, &scope).await?;
        node.teardown();
        Ok(())
    }

    /// Fan `sig` out to every currently `Running` node; `SIGKILL` after the
    /// configured grace window if they haven't exited (spec.md §4.3 "Signal
    /// API", §5 "Cancellation").
    pub async fn cancel(&self, plan: &ExecutionPlan) {
        let nodes = plan.nodes();
        for node in &nodes {
            let _ = node.signal(Signal::SIGTERM, true);
        }
        tokio::time::sleep(self.signal_grace).await;
        for node in &nodes {
            if node.status() == Status::Running {
                let _ = node.signal(Signal::SIGKILL, false);
            }
        }
        for node in &nodes {
            if node.status() == Status::NotStarted {
                node.cancel();
            }
        }
    }
}

/// Derive the final DAG status from node states (spec.md §4.3 "Determine
/// final DAG status").
///
/// A `Failed` node without a matching `ContinueOn` ("unmarked") always
/// yields `Failed`, even when the sweep in `run` also left sibling nodes
/// `Aborted` — that sweep reuses the `Aborted` status for "never got to
/// run because an upstream failed", which is a different situation from a
/// cancelled run where nothing failed at all.
fn derive_dag_status(nodes: &[Arc<Node>]) -> DagStatus {
    let mut any_aborted = false;
    let mut any_unmarked_failed = false;
    let mut any_succeeded = false;
    let mut any_continued_failure = false;

    for node in nodes {
        match node.status() {
            Status::Aborted => any_aborted = true,
            Status::Failed => {
                if node.should_continue() {
                    any_continued_failure = true;
                } else {
                    any_unmarked_failed = true;
                }
            }
            Status::Succeeded | Status::PartiallySucceeded => any_succeeded = true,
            _ => {}
        }
    }

    if any_unmarked_failed {
        return DagStatus::Failed;
    }
    if any_aborted {
        return DagStatus::Aborted;
    }
    if any_succeeded && any_continued_failure {
        return DagStatus::PartiallySucceeded;
    }
    DagStatus::Succeeded
}

impl RunContext {
    /// Cheap clone for handing an owned copy into a spawned task.
    fn clone_for_spawn(&self) -> Self {
        Self {
            dag_run_id: self.dag_run_id.clone(),
            dag_name: self.dag_name.clone(),
            log_dir: self.log_dir.clone(),
            dag_working_dir: self.dag_working_dir.clone(),
            dag_shell: self.dag_shell.clone(),
            max_output_size: self.max_output_size,
            sub_dag_runner: self.sub_dag_runner.clone(),
            signal_grace: self.signal_grace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StepMap;
    use crate::step::{ContinueOn, Step};
    use std::collections::HashMap;

    fn scope() -> Scope {
        Scope::new(vec![], HashMap::new(), HashMap::new(), vec![], StepMap::new(), "sh".into(), vec!["-c".into()])
    }

    fn ctx(dir: &tempfile::TempDir) -> RunContext {
        RunContext::new("cafebabe12345678", dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn linear_chain_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            Step::command("a", "true"),
            Step::command("b", "true").depends_on(["a"]),
            Step::command("c", "true").depends_on(["b"]),
        ];
        let plan = ExecutionPlan::new(steps).unwrap();
        let runner = Runner::new(0);
        let outcome = runner.run(&plan, &ctx(&dir), &scope(), &[], None, None).await.unwrap();
        assert_eq!(outcome.status, DagStatus::Succeeded);
        for node in plan.nodes() {
            assert_eq!(node.status(), Status::Succeeded);
        }
    }

    #[tokio::test]
    async fn failure_propagates_to_aborted_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            Step::command("a", "true"),
            Step::command("b", "exit 1").depends_on(["a"]),
            Step::command("c", "true").depends_on(["b"]),
        ];
        let plan = ExecutionPlan::new(steps).unwrap();
        let runner = Runner::new(0);
        let outcome = runner.run(&plan, &ctx(&dir), &scope(), &[], None, None).await.unwrap();
        assert_eq!(outcome.status, DagStatus::Failed);
        assert_eq!(plan.get_node_by_name("a").unwrap().status(), Status::Succeeded);
        assert_eq!(plan.get_node_by_name("b").unwrap().status(), Status::Failed);
        assert_eq!(plan.get_node_by_name("c").unwrap().status(), Status::Aborted);
    }

    #[tokio::test]
    async fn continue_on_failure_yields_partial_success() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            Step::command("a", "true"),
            Step::command("b", "exit 1")
                .depends_on(["a"])
                .with_continue_on(ContinueOn { failure: true, ..Default::default() }),
            Step::command("c", "true").depends_on(["b"]),
        ];
        let plan = ExecutionPlan::new(steps).unwrap();
        let runner = Runner::new(0);
        let outcome = runner.run(&plan, &ctx(&dir), &scope(), &[], None, None).await.unwrap();
        assert_eq!(outcome.status, DagStatus::PartiallySucceeded);
        assert_eq!(plan.get_node_by_name("b").unwrap().status(), Status::Failed);
        assert_eq!(plan.get_node_by_name("c").unwrap().status(), Status::Succeeded);
    }

    #[tokio::test]
    async fn failing_precondition_skips_the_node_and_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            Step::command("a", "true").with_preconditions(vec![crate::step::Condition {
                condition: "false".to_string(),
                expected: None,
                negate: false,
            }]),
            Step::command("b", "true").depends_on(["a"]),
        ];
        let plan = ExecutionPlan::new(steps).unwrap();
        let runner = Runner::new(0);
        runner.run(&plan, &ctx(&dir), &scope(), &[], None, None).await.unwrap();
        assert_eq!(plan.get_node_by_name("a").unwrap().status(), Status::Skipped);
        assert_eq!(plan.get_node_by_name("b").unwrap().status(), Status::Skipped);
    }

    #[tokio::test]
    async fn passing_precondition_lets_the_node_run() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![Step::command("a", "true").with_preconditions(vec![crate::step::Condition {
            condition: "true".to_string(),
            expected: None,
            negate: false,
        }])];
        let plan = ExecutionPlan::new(steps).unwrap();
        let runner = Runner::new(0);
        runner.run(&plan, &ctx(&dir), &scope(), &[], None, None).await.unwrap();
        assert_eq!(plan.get_node_by_name("a").unwrap().status(), Status::Succeeded);
    }

    #[tokio::test]
    async fn dotted_step_reference_resolves_against_a_completed_upstream_node() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            Step::command("a", "exit 7").with_id("s1").with_continue_on(ContinueOn {
                exit_code: vec![7],
                mark_success: true,
                ..Default::default()
            }),
            Step::command("b", "echo ${s1.exit_code}").depends_on(["a"]).with_output("OUT"),
        ];
        let plan = ExecutionPlan::new(steps).unwrap();
        let runner = Runner::new(0);
        let outcome = runner.run(&plan, &ctx(&dir), &scope(), &[], None, None).await.unwrap();
        assert_eq!(outcome.status, DagStatus::Succeeded);
        let b = plan.get_node_by_name("b").unwrap();
        assert_eq!(b.snapshot().output_variables.get("OUT").unwrap(), "7");
    }
}
