//! Parallel expansion (spec.md §4.2 step 2, §6 "Parallel item parsing").
//!
//! A `Parallel` step fans out into one sub-DAG invocation per item. Items
//! come from a resolved variable (a JSON array, or a whitespace-delimited
//! token list) or a literal list given in the step definition. Each item is
//! converted to a canonical param string; duplicates (same canonical form)
//! collapse to a single sub-run, since the sub-run id is a pure function of
//! the params (spec.md §9 open question: "the source deduplicates by
//! sub-run id").

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::NodeError;
use crate::subdag::{canonical_json, sub_run_id, SubDagRunner};
use crate::traits::{ExecutorOutcome, OutputSinks, PidSlot, StepExecutor, SubDagOutcome};

/// Cap from spec.md §4.2 step 2: "Items are capped at 1000".
pub const MAX_PARALLEL_ITEMS: usize = 1000;

/// Parse a raw resolved value into a list of param items.
///
/// A JSON-array-shaped string is parsed as such; otherwise the value is
/// split on whitespace into scalar tokens (spec.md §6: "a deterministic
/// separator sniff (JSON array → items; else whitespace-delimited
/// tokens)").
pub fn parse_items(raw: &str) -> Vec<serde_json::Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(trimmed) {
            return items;
        }
    }
    trimmed
        .split_whitespace()
        .map(|tok| serde_json::Value::String(tok.to_string()))
        .collect()
}

/// Cap, canonicalize, and dedupe by sub-run id. Returns `(run_id, item)`
/// pairs in first-seen order; logs (via `tracing::warn`) when a duplicate is
/// dropped or the cap truncates the list.
pub fn expand_items(
    items: Vec<serde_json::Value>,
    parent_run_id: &str,
    step_name: &str,
) -> Vec<(String, serde_json::Value)> {
    let truncated = items.len() > MAX_PARALLEL_ITEMS;
    let items: Vec<_> = items.into_iter().take(MAX_PARALLEL_ITEMS).collect();
    if truncated {
        tracing::warn!(
            step = step_name,
            "parallel expansion truncated to {} items",
            MAX_PARALLEL_ITEMS
        );
    }

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let canonical = canonical_json(&item);
        let run_id = sub_run_id(parent_run_id, step_name, &canonical, None);
        if seen.insert(run_id.clone()) {
            out.push((run_id, item));
        } else {
            tracing::warn!(
                step = step_name,
                "duplicate parallel item merged into existing sub-run {}",
                run_id
            );
        }
    }
    out
}

/// Runs one sub-DAG invocation per expanded item, concurrently, and
/// aggregates the per-item outcomes. Success is all-or-nothing unless the
/// caller treats a mixed result as `PartiallySucceeded` via `ContinueOn`
/// (decided by `engine::node`, not here).
pub struct ParallelExecutor {
    runner: std::sync::Arc<dyn SubDagRunner>,
    sub_dag_name: String,
    items: Vec<(String, serde_json::Value)>,
}

/// Outcome of the whole fan-out, one entry per expanded item.
pub struct ParallelOutcome {
    pub results: Vec<SubDagOutcome>,
}

impl ParallelExecutor {
    pub fn new(
        runner: std::sync::Arc<dyn SubDagRunner>,
        sub_dag_name: String,
        items: Vec<(String, serde_json::Value)>,
    ) -> Self {
        Self { runner, sub_dag_name, items }
    }

    pub async fn run_all(&self) -> Result<ParallelOutcome, NodeError> {
        let futures = self.items.iter().map(|(run_id, item)| {
            let runner = self.runner.clone();
            let name = self.sub_dag_name.clone();
            let item = item.clone();
            let run_id = run_id.clone();
            async move { runner.run_sub_dag(&name, item, &run_id).await }
        });

        let results: Result<Vec<_>, NodeError> = join_all(futures).await.into_iter().collect();
        Ok(ParallelOutcome { results: results? })
    }
}

#[async_trait]
impl StepExecutor for ParallelExecutor {
    async fn run(
        &mut self,
        _sinks: OutputSinks<'_>,
        _pid_slot: &PidSlot,
    ) -> Result<ExecutorOutcome, NodeError> {
        let outcome = self.run_all().await?;
        let all_succeeded = outcome.results.iter().all(|r| r.succeeded);
        Ok(ExecutorOutcome {
            exit_code: if all_succeeded { 0 } else { 1 },
            terminated_by_signal: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_array_is_parsed_as_items() {
        let items = parse_items(r#"["a", "b", "c"]"#);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn whitespace_tokens_are_parsed_as_items() {
        let items = parse_items("a b c");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], serde_json::Value::String("a".into()));
    }

    #[test]
    fn duplicate_params_collapse_to_one_subrun() {
        let items = vec![
            serde_json::json!({"x": 1}),
            serde_json::json!({"x": 1}),
            serde_json::json!({"x": 2}),
        ];
        let expanded = expand_items(items, "run1", "step1");
        assert_eq!(expanded.len(), 2);
    }

    #[test]
    fn cap_truncates_to_max_items() {
        let items: Vec<_> = (0..MAX_PARALLEL_ITEMS + 50)
            .map(|i| serde_json::json!({"i": i}))
            .collect();
        let expanded = expand_items(items, "run1", "step1");
        assert_eq!(expanded.len(), MAX_PARALLEL_ITEMS);
    }
}
