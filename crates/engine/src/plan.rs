//! Plan Builder (spec.md §4.1): turns an ordered list of [`Step`]s into an
//! [`ExecutionPlan`] with cycle detection via Kahn's algorithm.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::node::Node;
use crate::step::Step;

#[derive(Debug)]
struct PlanInner {
    nodes: Vec<Arc<Node>>,
    node_by_id: HashMap<u64, Arc<Node>>,
    node_by_name: HashMap<String, Arc<Node>>,
    dependencies: HashMap<u64, Vec<u64>>,
    dependents: HashMap<u64, Vec<u64>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Immutable-after-construction DAG of [`Node`]s for a single run (spec.md
/// §3 `ExecutionPlan`). All accessors return copies under a reader lock;
/// `finish` takes the writer lock.
#[derive(Debug)]
pub struct ExecutionPlan {
    inner: RwLock<PlanInner>,
}

impl ExecutionPlan {
    /// `NewPlan(steps…)` (spec.md §4.1): assigns each step a fresh
    /// monotonic node id, wires `depName → name` edges, and fails with
    /// [`Error::StepNotFound`] or [`Error::CyclicPlan`].
    pub fn new(steps: Vec<Step>) -> Result<Self, Error> {
        let mut node_by_name = HashMap::new();
        let mut nodes = Vec::with_capacity(steps.len());
        let mut node_by_id = HashMap::new();

        for (id, step) in steps.into_iter().enumerate() {
            let id = id as u64;
            let name = step.name.clone();
            let node = Arc::new(Node::new(id, step));
            node_by_name.insert(name, node.clone());
            node_by_id.insert(id, node.clone());
            nodes.push(node);
        }

        let mut dependencies: HashMap<u64, Vec<u64>> = nodes.iter().map(|n| (n.id, Vec::new())).collect();
        let mut dependents: HashMap<u64, Vec<u64>> = nodes.iter().map(|n| (n.id, Vec::new())).collect();

        for node in &nodes {
            for dep_name in &node.step.depends {
                let dep_node = node_by_name
                    .get(dep_name)
                    .ok_or_else(|| Error::StepNotFound(dep_name.clone()))?;
                dependencies.get_mut(&node.id).unwrap().push(dep_node.id);
                dependents.get_mut(&dep_node.id).unwrap().push(node.id);
            }
        }

        check_acyclic(&nodes, &dependencies)?;

        Ok(Self {
            inner: RwLock::new(PlanInner {
                nodes,
                node_by_id,
                node_by_name,
                dependencies,
                dependents,
                started_at: None,
                finished_at: None,
            }),
        })
    }

    /// `CreateRetryPlan` (spec.md §4.1): keep existing node states, reset
    /// any `Failed`/`Aborted` node plus every transitive dependent (BFS over
    /// `dependents`); `Skipped`/`Succeeded` nodes not reached stay.
    pub fn create_retry_plan(&self, steps: Vec<Step>, previous: &ExecutionPlan) -> Result<Self, Error> {
        let plan = Self::new(steps)?;
        let prev = previous.inner.read().unwrap();
        let cur = plan.inner.read().unwrap();

        let mut to_reset = HashSet::new();
        for prev_node in &prev.nodes {
            if matches!(prev_node.status(), crate::node::Status::Failed | crate::node::Status::Aborted) {
                if let Some(cur_node) = cur.node_by_name.get(&prev_node.step.name) {
                    to_reset.insert(cur_node.id);
                }
            } else if let Some(cur_node) = cur.node_by_name.get(&prev_node.step.name) {
                // Carry forward the full terminal state from the prior run,
                // not just its status, so output variables and log paths a
                // preserved node produced stay resolvable by downstream
                // steps (spec.md §4.1 "preserves existing node states").
                cur_node.restore(prev_node.snapshot());
            }
        }

        let mut queue: VecDeque<u64> = to_reset.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            for &dependent in cur.dependents.get(&id).into_iter().flatten() {
                if to_reset.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        for id in &to_reset {
            cur.node_by_id.get(id).unwrap().reset();
        }

        drop(prev);
        drop(cur);
        Ok(plan)
    }

    /// `CreateStepRetryPlan` (spec.md §4.1): resets only the named node,
    /// regardless of prior status; downstream nodes are untouched.
    pub fn create_step_retry_plan(steps: Vec<Step>, previous: &ExecutionPlan, step_name: &str) -> Result<Self, Error> {
        let plan = Self::new(steps)?;
        let prev = previous.inner.read().unwrap();
        let cur = plan.inner.read().unwrap();

        for prev_node in &prev.nodes {
            if prev_node.step.name == step_name {
                continue;
            }
            if let Some(cur_node) = cur.node_by_name.get(&prev_node.step.name) {
                cur_node.restore(prev_node.snapshot());
            }
        }

        if let Some(node) = cur.node_by_name.get(step_name) {
            node.reset();
        } else {
            return Err(Error::StepNotFound(step_name.to_string()));
        }

        drop(prev);
        drop(cur);
        Ok(plan)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.read().unwrap().nodes.clone()
    }

    pub fn get_node_by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.inner.read().unwrap().node_by_name.get(name).cloned()
    }

    pub fn get_node_by_id(&self, id: u64) -> Option<Arc<Node>> {
        self.inner.read().unwrap().node_by_id.get(&id).cloned()
    }

    pub fn dependencies(&self, id: u64) -> Vec<u64> {
        self.inner.read().unwrap().dependencies.get(&id).cloned().unwrap_or_default()
    }

    pub fn dependents(&self, id: u64) -> Vec<u64> {
        self.inner.read().unwrap().dependents.get(&id).cloned().unwrap_or_default()
    }

    pub fn mark_started(&self) {
        self.inner.write().unwrap().started_at = Some(Utc::now());
    }

    /// Idempotent: only the writer lock-guarded transition matters; second
    /// calls just overwrite the timestamp (spec.md §3 "Plan is
    /// `Finish`-ed once when the runner returns").
    pub fn finish(&self) {
        self.inner.write().unwrap().finished_at = Some(Utc::now());
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap().finished_at
    }
}

/// Kahn's algorithm: peel zero-in-degree nodes, decrement dependents'
/// in-degree; if the processed count doesn't reach the node count, the
/// remainder forms a cycle.
fn check_acyclic(nodes: &[Arc<Node>], dependencies: &HashMap<u64, Vec<u64>>) -> Result<(), Error> {
    let mut in_degree: HashMap<u64, usize> =
        nodes.iter().map(|n| (n.id, dependencies.get(&n.id).map(Vec::len).unwrap_or(0))).collect();

    let mut dependents: HashMap<u64, Vec<u64>> = nodes.iter().map(|n| (n.id, Vec::new())).collect();
    for node in nodes {
        for &dep in dependencies.get(&node.id).into_iter().flatten() {
            dependents.get_mut(&dep).unwrap().push(node.id);
        }
    }

    let mut queue: VecDeque<u64> =
        in_degree.iter().filter(|(_, &deg)| deg == 0).map(|(&id, _)| id).collect();
    let mut processed = 0;

    while let Some(id) = queue.pop_front() {
        processed += 1;
        for &dependent in dependents.get(&id).into_iter().flatten() {
            let degree = in_degree.get_mut(&dependent).unwrap();
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if processed != nodes.len() {
        return Err(Error::CyclicPlan);
    }
    Ok(())
}
