//! Condition evaluator (spec.md §4.5).

use regex::Regex;

use crate::env::Scope;
use crate::error::Error;
use crate::step::Condition;

/// Evaluate one [`Condition`] against `scope`.
///
/// - `condition` + `expected` set: expand `condition` (including command
///   substitution) and compare to `expected`, either exactly or, if
///   `expected` is `re:`-prefixed, as an anchored regex.
/// - `condition` only: expand variables (no command substitution), then
///   execute the result as a shell command; exit 0 passes.
///
/// `negate` inverts only a resulting [`Error::ConditionNotMet`] — evaluation
/// failures (`ConditionEvalFailed`) always propagate unchanged (spec.md
/// §4.5 "Negate").
pub async fn evaluate(condition: &Condition, scope: &Scope) -> Result<(), Error> {
    let result = match &condition.expected {
        Some(expected) => evaluate_expected(condition, expected, scope).await,
        None => evaluate_exec(condition, scope).await,
    };

    if condition.negate {
        return match result {
            Ok(()) => Err(Error::ConditionNotMet(format!(
                "negated condition '{}' unexpectedly matched",
                condition.condition
            ))),
            Err(Error::ConditionNotMet(_)) => Ok(()),
            Err(other) => Err(other),
        };
    }
    result
}

async fn evaluate_expected(condition: &Condition, expected: &str, scope: &Scope) -> Result<(), Error> {
    let actual = scope
        .expand(&condition.condition)
        .await
        .map_err(|e| Error::ConditionEvalFailed(e.to_string()))?;

    let matched = match expected.strip_prefix("re:") {
        Some(pattern) => {
            let re = Regex::new(pattern)
                .map_err(|e| Error::ConditionEvalFailed(format!("invalid regex '{pattern}': {e}")))?;
            re.is_match(&actual)
        }
        None => actual == expected,
    };

    if matched {
        Ok(())
    } else {
        Err(Error::ConditionNotMet(format!(
            "condition '{}' evaluated to '{actual}', expected '{expected}'",
            condition.condition
        )))
    }
}

async fn evaluate_exec(condition: &Condition, scope: &Scope) -> Result<(), Error> {
    let command = scope
        .expand_vars_only(&condition.condition)
        .await
        .map_err(|e| Error::ConditionEvalFailed(e.to_string()))?;

    let status = tokio::process::Command::new(&scope.shell)
        .args(&scope.shell_args)
        .arg(&command)
        .envs(scope.materialize())
        .status()
        .await
        .map_err(|e| Error::ConditionEvalFailed(format!("exec failed: {e}")))?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::ConditionNotMet(format!(
            "condition '{command}' exited with {status}"
        )))
    }
}

/// Evaluate every condition in `list`. If any fails, every non-erroring
/// entry's message is rewritten to `"other condition was not met"` (spec.md
/// §4.5 `EvalConditions`). Returns the last error encountered, or `Ok(())`.
pub async fn eval_conditions(list: &[Condition], scope: &Scope) -> Result<(), Error> {
    let mut results = Vec::with_capacity(list.len());
    for condition in list {
        results.push(evaluate(condition, scope).await);
    }

    if results.iter().all(Result::is_ok) {
        return Ok(());
    }

    let mut last_err = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(Error::ConditionNotMet(_)) => {
                last_err = Some(Error::ConditionNotMet("other condition was not met".into()));
            }
            Err(other) => last_err = Some(other),
        }
    }
    Err(last_err.expect("at least one condition failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scope() -> Scope {
        crate::env::Scope::new(
            vec![],
            HashMap::new(),
            HashMap::new(),
            vec![],
            crate::env::StepMap::new(),
            "sh".into(),
            vec!["-c".into()],
        )
    }

    fn cond(condition: &str, expected: Option<&str>, negate: bool) -> Condition {
        Condition { condition: condition.into(), expected: expected.map(Into::into), negate }
    }

    #[tokio::test]
    async fn exact_match_passes() {
        assert!(evaluate(&cond("stable", Some("stable"), false), &scope()).await.is_ok());
    }

    #[tokio::test]
    async fn mismatch_fails() {
        let err = evaluate(&cond("stable", Some("unstable"), false), &scope()).await.unwrap_err();
        assert!(matches!(err, Error::ConditionNotMet(_)));
    }

    #[tokio::test]
    async fn regex_prefix_matches() {
        assert!(evaluate(&cond("v1.2.3", Some("re:^v\\d+\\."), false), &scope()).await.is_ok());
    }

    #[tokio::test]
    async fn exec_only_passes_on_exit_zero() {
        assert!(evaluate(&cond("true", None, false), &scope()).await.is_ok());
    }

    #[tokio::test]
    async fn exec_only_fails_on_nonzero_exit() {
        let err = evaluate(&cond("false", None, false), &scope()).await.unwrap_err();
        assert!(matches!(err, Error::ConditionNotMet(_)));
    }

    #[tokio::test]
    async fn negate_inverts_condition_not_met() {
        assert!(evaluate(&cond("false", None, true), &scope()).await.is_ok());
    }

    #[tokio::test]
    async fn negate_does_not_invert_eval_failure() {
        let err = evaluate(&cond("x", Some("re:("), true), &scope()).await.unwrap_err();
        assert!(matches!(err, Error::ConditionEvalFailed(_)));
    }

    #[tokio::test]
    async fn eval_conditions_rewrites_messages_on_any_failure() {
        let list = vec![cond("true", None, false), cond("false", None, false)];
        let err = eval_conditions(&list, &scope()).await.unwrap_err();
        assert_eq!(err.to_string(), "condition not met: other condition was not met");
    }

    #[tokio::test]
    async fn eval_conditions_passes_when_all_pass() {
        let list = vec![cond("true", None, false), cond("true", None, false)];
        assert!(eval_conditions(&list, &scope()).await.is_ok());
    }
}
