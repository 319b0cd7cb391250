//! Sub-DAG invocation: the `SubDagRunner` callback interface and the
//! deterministic sub-run id function from spec.md §4.2.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::NodeError;
use crate::traits::{ExecutorOutcome, OutputSinks, PidSlot, StepExecutor, SubDagOutcome};

/// Implemented by the engine (which owns `Runner`) so `nodes` can dispatch a
/// sub-DAG invocation without depending back on `engine` — the capability is
/// injected rather than called directly, avoiding a dependency cycle.
#[async_trait]
pub trait SubDagRunner: Send + Sync {
    async fn run_sub_dag(
        &self,
        name: &str,
        params: serde_json::Value,
        run_id: &str,
    ) -> Result<SubDagOutcome, NodeError>;
}

/// `base58(SHA-256("<parentRunID>:<stepName>:<canonicalJSONParams>"))`,
/// optionally namespaced by a repeat iteration counter (spec.md §4.2,
/// "Repeated iterations namespace by adding an iteration counter before
/// hashing").
pub fn sub_run_id(
    parent_run_id: &str,
    step_name: &str,
    canonical_params: &str,
    iteration: Option<u32>,
) -> String {
    let mut hasher = Sha256::new();
    match iteration {
        Some(i) => hasher.update(format!(
            "{parent_run_id}:{step_name}:{i}:{canonical_params}"
        )),
        None => hasher.update(format!("{parent_run_id}:{step_name}:{canonical_params}")),
    }
    bs58::encode(hasher.finalize()).into_string()
}

/// Canonicalize a JSON value to a sorted-key string, so two semantically
/// identical param maps produce the same sub-run id regardless of original
/// key order (spec.md §6, "Map-typed items are canonicalized to
/// sorted-key JSON").
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted = serde_json::Map::new();
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for k in keys {
                    sorted.insert(k.clone(), sort(&map[k]));
                }
                serde_json::Value::Object(sorted)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

pub struct SubDagExecutor {
    runner: std::sync::Arc<dyn SubDagRunner>,
    name: String,
    params: serde_json::Value,
    parent_run_id: String,
    step_name: String,
    iteration: Option<u32>,
}

impl SubDagExecutor {
    pub fn new(
        runner: std::sync::Arc<dyn SubDagRunner>,
        name: String,
        params: serde_json::Value,
        parent_run_id: String,
        step_name: String,
        iteration: Option<u32>,
    ) -> Self {
        Self { runner, name, params, parent_run_id, step_name, iteration }
    }

    pub fn run_id(&self) -> String {
        sub_run_id(
            &self.parent_run_id,
            &self.step_name,
            &canonical_json(&self.params),
            self.iteration,
        )
    }
}

#[async_trait]
impl StepExecutor for SubDagExecutor {
    async fn run(
        &mut self,
        _sinks: OutputSinks<'_>,
        _pid_slot: &PidSlot,
    ) -> Result<ExecutorOutcome, NodeError> {
        let run_id = self.run_id();
        let outcome = self
            .runner
            .run_sub_dag(&self.name, self.params.clone(), &run_id)
            .await?;
        Ok(ExecutorOutcome {
            exit_code: outcome.exit_code,
            terminated_by_signal: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_params_produce_same_run_id_regardless_of_key_order() {
        let a = serde_json::json!({"x": 1, "y": 2});
        let b = serde_json::json!({"y": 2, "x": 1});
        let id_a = sub_run_id("parent", "step", &canonical_json(&a), None);
        let id_b = sub_run_id("parent", "step", &canonical_json(&b), None);
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn different_iterations_produce_different_run_ids() {
        let params = serde_json::json!({"x": 1});
        let canon = canonical_json(&params);
        let id0 = sub_run_id("parent", "step", &canon, Some(0));
        let id1 = sub_run_id("parent", "step", &canon, Some(1));
        assert_ne!(id0, id1);
    }

    #[test]
    fn different_params_produce_different_run_ids() {
        let a = canonical_json(&serde_json::json!({"x": 1}));
        let b = canonical_json(&serde_json::json!({"x": 2}));
        assert_ne!(
            sub_run_id("parent", "step", &a, None),
            sub_run_id("parent", "step", &b, None)
        );
    }
}
