//! `ProcessExecutor` — runs a resolved shell command (or inline script body)
//! as a child OS process via `tokio::process::Command`.
//!
//! `Step.Commands` and `Step.Script` both collapse into this executor: a
//! multi-command step is joined into a single `&&`-chained script body
//! before it reaches here, since both forms ultimately mean "hand this text
//! to the resolved shell". `Step.Shell`/`Step.ShellArgs` select the
//! interpreter; default is `sh -c`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::NodeError;
use crate::traits::{ExecutorOutcome, OutputSinks, PidSlot, StepExecutor};

/// A fully resolved (post variable-expansion) process invocation.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub shell: String,
    pub shell_args: Vec<String>,
    /// The script body passed to the shell, e.g. via `sh -c "<body>"`.
    pub body: String,
    pub env: Vec<(String, String)>,
    pub dir: PathBuf,
}

pub struct ProcessExecutor {
    spec: ProcessSpec,
}

impl ProcessExecutor {
    pub fn new(spec: ProcessSpec) -> Self {
        Self { spec }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.shell);
        cmd.args(&self.spec.shell_args);
        cmd.arg(&self.spec.body);
        cmd.current_dir(&self.spec.dir);
        cmd.envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    /// Resolve an exit code the way spec.md §4.2 step 5 prescribes, from a
    /// `std::process::ExitStatus`.
    fn exit_code_from_status(status: std::process::ExitStatus) -> ExecutorOutcome {
        if let Some(code) = status.code() {
            return ExecutorOutcome { exit_code: code, terminated_by_signal: false };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if status.signal().is_some() {
                return ExecutorOutcome { exit_code: -1, terminated_by_signal: true };
            }
        }
        ExecutorOutcome { exit_code: 1, terminated_by_signal: false }
    }
}

#[async_trait]
impl StepExecutor for ProcessExecutor {
    async fn run(
        &mut self,
        sinks: OutputSinks<'_>,
        pid_slot: &PidSlot,
    ) -> Result<ExecutorOutcome, NodeError> {
        let mut command = self.build_command();
        let mut child = command.spawn().map_err(NodeError::Spawn)?;

        // Publish the pid before awaiting anything, so a concurrent
        // `signal_pid` call can reach this process for the whole lifetime
        // of the attempt.
        *pid_slot.lock().unwrap() = child.id();

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let copy_out = tokio::io::copy(&mut stdout, sinks.stdout);
        let copy_err = tokio::io::copy(&mut stderr, sinks.stderr);

        let (out_res, err_res, status) = tokio::join!(copy_out, copy_err, child.wait());
        *pid_slot.lock().unwrap() = None;
        out_res?;
        err_res?;

        let status = status.map_err(NodeError::Io)?;
        Ok(Self::exit_code_from_status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn spec(body: &str) -> ProcessSpec {
        ProcessSpec {
            shell: "sh".into(),
            shell_args: vec!["-c".into()],
            body: body.into(),
            env: vec![],
            dir: std::env::temp_dir(),
        }
    }

    fn pid_slot() -> PidSlot {
        Arc::new(Mutex::new(None))
    }

    #[tokio::test]
    async fn successful_command_returns_exit_code_zero() {
        let mut executor = ProcessExecutor::new(spec("exit 0"));
        let mut out = Vec::new();
        let mut err = Vec::new();
        let outcome = executor
            .run(OutputSinks { stdout: &mut out, stderr: &mut err }, &pid_slot())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn failing_command_propagates_exit_code() {
        let mut executor = ProcessExecutor::new(spec("exit 7"));
        let mut out = Vec::new();
        let mut err = Vec::new();
        let outcome = executor
            .run(OutputSinks { stdout: &mut out, stderr: &mut err }, &pid_slot())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn stdout_is_captured() {
        let mut executor = ProcessExecutor::new(spec("echo hello"));
        let mut out = Vec::new();
        let mut err = Vec::new();
        executor
            .run(OutputSinks { stdout: &mut out, stderr: &mut err }, &pid_slot())
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[tokio::test]
    async fn signal_terminates_long_running_command() {
        let mut executor = ProcessExecutor::new(spec("sleep 5"));
        let mut out = Vec::new();
        let mut err = Vec::new();
        let slot = pid_slot();

        let slot2 = slot.clone();
        let signaller = tokio::spawn(async move {
            // Give the child a moment to publish its pid.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            crate::traits::signal_pid(&slot2, nix::sys::signal::Signal::SIGTERM).unwrap();
        });

        let outcome = executor
            .run(OutputSinks { stdout: &mut out, stderr: &mut err }, &slot)
            .await
            .unwrap();
        signaller.await.unwrap();

        assert!(outcome.terminated_by_signal);
        assert_eq!(outcome.exit_code, -1);
    }
}
