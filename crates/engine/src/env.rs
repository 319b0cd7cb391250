//! Environment & variable scope (spec.md §4.4).
//!
//! A per-node layered lookup — step env, transitive upstream output
//! variables, secrets, DAG env, OS env, highest precedence first — plus
//! `$VAR`/`${VAR}`/backtick-command-substitution expansion and dotted
//! `${stepID.stdout|stderr|exit_code}` resolution against a separate
//! per-plan [`StepMap`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::Error;

/// What a completed node publishes for `${id.stdout|stderr|exit_code}`
/// references. Keyed by `Step.ID` (not `Step.Name`) in the plan's
/// [`StepMap`].
#[derive(Debug, Clone)]
pub struct StepRef {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub exit_code: i32,
}

/// Per-plan registry of completed steps' log paths and exit codes, shared by
/// every node's [`Scope`] so dotted references resolve regardless of
/// dependency direction (downstream nodes read entries their upstream
/// siblings wrote).
#[derive(Debug, Clone, Default)]
pub struct StepMap(Arc<RwLock<HashMap<String, StepRef>>>);

impl StepMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, step_id: &str, step_ref: StepRef) {
        self.0.write().unwrap().insert(step_id.to_string(), step_ref);
    }

    pub fn get(&self, step_id: &str) -> Option<StepRef> {
        self.0.read().unwrap().get(step_id).cloned()
    }
}

/// The layered variable scope for a single node. Built fresh at `Prepare`
/// time (spec.md §4.4 invariant); `with_entries` appends without disturbing
/// earlier layers, for output-variable exports during a repeat loop.
#[derive(Debug, Clone)]
pub struct Scope {
    step_env: Vec<(String, String)>,
    output_vars: HashMap<String, String>,
    secrets: HashMap<String, String>,
    dag_env: Vec<(String, String)>,
    os_env: HashMap<String, String>,
    step_map: StepMap,
    pub shell: String,
    pub shell_args: Vec<String>,
}

impl Scope {
    pub fn new(
        step_env: Vec<(String, String)>,
        output_vars: HashMap<String, String>,
        secrets: HashMap<String, String>,
        dag_env: Vec<(String, String)>,
        step_map: StepMap,
        shell: String,
        shell_args: Vec<String>,
    ) -> Self {
        let os_env = std::env::vars().collect();
        Self { step_env, output_vars, secrets, dag_env, os_env, step_map, shell, shell_args }
    }

    /// Append entries at the highest-precedence layer. Affects only
    /// expansions performed after this call, on this `Scope` instance
    /// (spec.md §4.4 invariant: "take effect for subsequent expansions
    /// within the same node only").
    pub fn with_entries(&mut self, entries: impl IntoIterator<Item = (String, String)>) {
        self.step_env.extend(entries);
    }

    /// First-hit-wins lookup across the five layers, highest precedence
    /// first.
    pub fn get(&self, key: &str) -> Option<&str> {
        for (k, v) in self.step_env.iter().rev() {
            if k == key {
                return Some(v);
            }
        }
        if let Some(v) = self.output_vars.get(key) {
            return Some(v);
        }
        if let Some(v) = self.secrets.get(key) {
            return Some(v);
        }
        for (k, v) in self.dag_env.iter().rev() {
            if k == key {
                return Some(v);
            }
        }
        self.os_env.get(key).map(|s| s.as_str())
    }

    /// The per-plan `StepMap` this scope resolves dotted step references
    /// against — shared (via `Arc`) with every other node's cloned
    /// `Scope`, so a completed node's publish is visible to all of them.
    pub fn step_map(&self) -> &StepMap {
        &self.step_map
    }

    /// Materialize the full environment for a subprocess: every layer
    /// overlaid bottom-to-top so the highest-precedence value for each key
    /// wins, in a form suitable for `Command::envs`.
    pub fn materialize(&self) -> Vec<(String, String)> {
        let mut merged: HashMap<String, String> = self.os_env.clone();
        for (k, v) in &self.dag_env {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.secrets {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.output_vars {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.step_env {
            merged.insert(k.clone(), v.clone());
        }
        merged.into_iter().collect()
    }

    /// Expand `$VAR`, `${VAR}`, backtick command substitution, and dotted
    /// `${stepID.stdout|stderr|exit_code}` references in `template`.
    pub async fn expand(&self, template: &str) -> Result<String, Error> {
        self.expand_impl(template, true).await
    }

    /// Expand only `$VAR`/`${VAR}` (including dotted step references) —
    /// no command substitution. Used by the condition evaluator's
    /// "Condition-only" mode (spec.md §4.5).
    pub async fn expand_vars_only(&self, template: &str) -> Result<String, Error> {
        self.expand_impl(template, false).await
    }

    async fn expand_impl(&self, template: &str, allow_command_subst: bool) -> Result<String, Error> {
        let chars: Vec<char> = template.chars().collect();
        let mut out = String::with_capacity(template.len());
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '`' if allow_command_subst => {
                    if let Some(end) = find_char(&chars, i + 1, '`') {
                        let command: String = chars[i + 1..end].iter().collect();
                        let result = self.run_command_substitution(&command).await?;
                        out.push_str(result.trim_end_matches('\n'));
                        i = end + 1;
                    } else {
                        out.push(chars[i]);
                        i += 1;
                    }
                }
                '$' if i + 1 < chars.len() && chars[i + 1] == '{' => {
                    if let Some(end) = find_char(&chars, i + 2, '}') {
                        let inner: String = chars[i + 2..end].iter().collect();
                        out.push_str(&self.resolve_reference(&inner));
                        i = end + 1;
                    } else {
                        out.push(chars[i]);
                        i += 1;
                    }
                }
                '$' if i + 1 < chars.len() && is_ident_start(chars[i + 1]) => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && is_ident_char(chars[end]) {
                        end += 1;
                    }
                    let name: String = chars[start..end].iter().collect();
                    out.push_str(self.get(&name).unwrap_or(""));
                    i = end;
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        Ok(out)
    }

    fn resolve_reference(&self, inner: &str) -> String {
        if let Some(dot) = inner.rfind('.') {
            let (step_id, field) = (&inner[..dot], &inner[dot + 1..]);
            if matches!(field, "stdout" | "stderr" | "exit_code") {
                if let Some(step_ref) = self.step_map.get(step_id) {
                    return match field {
                        "stdout" => step_ref.stdout.display().to_string(),
                        "stderr" => step_ref.stderr.display().to_string(),
                        _ => step_ref.exit_code.to_string(),
                    };
                }
                return String::new();
            }
        }
        self.get(inner).unwrap_or("").to_string()
    }

    async fn run_command_substitution(&self, command: &str) -> Result<String, Error> {
        let output = tokio::process::Command::new(&self.shell)
            .args(&self.shell_args)
            .arg(command)
            .envs(self.materialize())
            .output()
            .await
            .map_err(|e| Error::SetupFailed(format!("command substitution failed: {e}")))?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn find_char(chars: &[char], from: usize, target: char) -> Option<usize> {
    chars[from..].iter().position(|&c| c == target).map(|p| p + from)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Resolve `Step.Dir` per spec.md §4.4 "WorkingDir resolution": tilde
/// expansion for an absolute/`~`-rooted path, joined against
/// `dag_working_dir` when relative, falling back to the process cwd then
/// `$HOME`.
pub fn resolve_working_dir(
    step_dir: Option<&str>,
    dag_working_dir: Option<&Path>,
) -> Result<PathBuf, Error> {
    let raw = match step_dir {
        Some(d) => d.to_string(),
        None => {
            if let Some(dag_dir) = dag_working_dir {
                return Ok(dag_dir.to_path_buf());
            }
            return std::env::current_dir()
                .or_else(|_| std::env::var("HOME").map(PathBuf::from))
                .map_err(|_| Error::SetupFailed("cannot resolve working directory".into()));
        }
    };

    let expanded = expand_tilde(&raw);
    if expanded.is_absolute() {
        return Ok(expanded);
    }
    match dag_working_dir {
        Some(dag_dir) => Ok(dag_dir.join(expanded)),
        None => std::env::current_dir()
            .map(|cwd| cwd.join(expanded))
            .map_err(|e| Error::SetupFailed(format!("cannot resolve working directory: {e}"))),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(path)
}

/// Resolve the interpreter: step shell > DAG shell > `sh`, evaluated through
/// `scope` so `${VAR}` in the shell name itself is honored.
pub async fn resolve_shell(
    step_shell: Option<&str>,
    dag_shell: Option<&str>,
    scope: &Scope,
) -> Result<String, Error> {
    let raw = step_shell.or(dag_shell).unwrap_or("sh");
    scope.expand(raw).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_with(step_env: Vec<(&str, &str)>, dag_env: Vec<(&str, &str)>) -> Scope {
        Scope::new(
            step_env.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            HashMap::new(),
            HashMap::new(),
            dag_env.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            StepMap::new(),
            "sh".to_string(),
            vec!["-c".to_string()],
        )
    }

    #[tokio::test]
    async fn step_env_overrides_dag_env() {
        let scope = scope_with(vec![("X", "step")], vec![("X", "dag")]);
        assert_eq!(scope.expand("${X}").await.unwrap(), "step");
    }

    #[tokio::test]
    async fn bare_dollar_var_is_expanded() {
        let scope = scope_with(vec![("NAME", "world")], vec![]);
        assert_eq!(scope.expand("hello $NAME!").await.unwrap(), "hello world!");
    }

    #[tokio::test]
    async fn backtick_command_substitution() {
        let scope = scope_with(vec![], vec![]);
        assert_eq!(scope.expand("value=`echo hi`").await.unwrap(), "value=hi");
    }

    #[tokio::test]
    async fn unset_variable_expands_to_empty_string() {
        let scope = scope_with(vec![], vec![]);
        assert_eq!(scope.expand("[${MISSING}]").await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn dotted_step_reference_resolves_from_step_map() {
        let step_map = StepMap::new();
        step_map.publish(
            "s1",
            StepRef { stdout: PathBuf::from("/tmp/s1.out"), stderr: PathBuf::from("/tmp/s1.err"), exit_code: 3 },
        );
        let scope = Scope::new(vec![], HashMap::new(), HashMap::new(), vec![], step_map, "sh".into(), vec!["-c".into()]);
        assert_eq!(scope.expand("${s1.exit_code}").await.unwrap(), "3");
        assert_eq!(scope.expand("${s1.stdout}").await.unwrap(), "/tmp/s1.out");
    }

    #[tokio::test]
    async fn expand_vars_only_does_not_execute_backticks() {
        let scope = scope_with(vec![], vec![]);
        let result = scope.expand_vars_only("literal `echo hi`").await.unwrap();
        assert_eq!(result, "literal `echo hi`");
    }

    #[test]
    fn relative_dir_is_joined_against_dag_working_dir() {
        let resolved = resolve_working_dir(Some("subdir"), Some(Path::new("/base"))).unwrap();
        assert_eq!(resolved, PathBuf::from("/base/subdir"));
    }

    #[test]
    fn absolute_dir_is_used_as_is() {
        let resolved = resolve_working_dir(Some("/abs/path"), Some(Path::new("/base"))).unwrap();
        assert_eq!(resolved, PathBuf::from("/abs/path"));
    }
}
