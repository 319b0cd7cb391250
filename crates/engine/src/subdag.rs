//! Sub-DAG dispatch: the engine's implementation of `nodes::SubDagRunner`,
//! closing the recursion a `SubDag`/`Parallel` step needs without engine and
//! nodes depending on each other directly (spec.md §9 "avoiding a
//! dependency cycle").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use nodes::subdag::SubDagRunner;
use nodes::{NodeError, SubDagOutcome};

use crate::env::{Scope, StepMap};
use crate::node::RunContext;
use crate::plan::ExecutionPlan;
use crate::runner::{DagStatus, Runner};
use crate::step::Step;

/// A registry of named DAGs this process can dispatch a sub-run against.
/// Loading DAG definitions from disk is out of scope for the core (spec.md
/// §1); callers populate this with whatever steps they already resolved.
pub struct DagRegistry {
    dags: RwLock<HashMap<String, Vec<Step>>>,
    log_root: PathBuf,
    max_active_steps: usize,
}

impl DagRegistry {
    pub fn new(log_root: PathBuf) -> Self {
        Self { dags: RwLock::new(HashMap::new()), log_root, max_active_steps: 0 }
    }

    pub fn with_max_active_steps(mut self, max: usize) -> Self {
        self.max_active_steps = max;
        self
    }

    pub fn register(&self, name: impl Into<String>, steps: Vec<Step>) {
        self.dags.write().unwrap().insert(name.into(), steps);
    }
}

#[async_trait]
impl SubDagRunner for DagRegistry {
    async fn run_sub_dag(
        &self,
        name: &str,
        params: serde_json::Value,
        run_id: &str,
    ) -> Result<SubDagOutcome, NodeError> {
        let steps = self
            .dags
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| NodeError::SubDagFailed { name: name.to_string(), message: "unknown sub-dag".into() })?;

        let plan = ExecutionPlan::new(steps)
            .map_err(|e| NodeError::SubDagFailed { name: name.to_string(), message: e.to_string() })?;

        let run_ctx = RunContext::new(run_id, self.log_root.join(run_id));
        let mut scope = Scope::new(vec![], HashMap::new(), HashMap::new(), vec![], StepMap::new(), "sh".into(), vec!["-c".into()]);
        if let serde_json::Value::Object(map) = &params {
            let entries = map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect::<Vec<_>>();
            scope.with_entries(entries);
        }

        let runner = Runner::new(self.max_active_steps);
        let outcome = runner
            .run(&plan, &run_ctx, &scope, &[], None, None)
            .await
            .map_err(|e| NodeError::SubDagFailed { name: name.to_string(), message: e.to_string() })?;

        let succeeded = matches!(outcome.status, DagStatus::Succeeded | DagStatus::PartiallySucceeded);
        let output = plan
            .nodes()
            .last()
            .and_then(|n| n.snapshot().output_variables.values().next().cloned())
            .map(serde_json::Value::String);

        Ok(SubDagOutcome { run_id: run_id.to_string(), succeeded, exit_code: if succeeded { 0 } else { 1 }, output })
    }
}

fn value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;

    #[tokio::test]
    async fn dispatches_a_registered_sub_dag_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DagRegistry::new(dir.path().to_path_buf());
        registry.register("child", vec![Step::command("only", "true")]);

        let outcome = registry.run_sub_dag("child", serde_json::json!({}), "run1").await.unwrap();
        assert!(outcome.succeeded);
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn unknown_sub_dag_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DagRegistry::new(dir.path().to_path_buf());
        let err = registry.run_sub_dag("missing", serde_json::json!({}), "run1").await.unwrap_err();
        assert!(matches!(err, NodeError::SubDagFailed { .. }));
    }

    #[tokio::test]
    async fn failing_sub_dag_is_reported_as_unsuccessful() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DagRegistry::new(dir.path().to_path_buf());
        registry.register("child", vec![Step::command("only", "exit 1")]);

        let outcome = registry.run_sub_dag("child", serde_json::json!({}), "run1").await.unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.exit_code, 1);
    }
}
