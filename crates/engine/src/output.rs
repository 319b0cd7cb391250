//! Output capture and log file sinks (spec.md §4.2 step 3-6, §5).
//!
//! Each node's subprocess output is fanned out to: the log file on disk,
//! and a capped in-memory buffer (used for `Output` capture and for
//! `continueOn.output` regex matching). `tokio::fs::File` dispatches every
//! write as its own blocking op, so there's no userspace buffering layer
//! that needs a separate periodic flusher the way a `bufio.Writer` would —
//! this coordinator skips spawning one for that reason.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use regex::Regex;
use tokio::io::AsyncWrite;

use crate::error::Error;

/// Default cap on captured output (spec.md §4.2 step 6): 1 MiB; `0` means
/// unlimited.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// An `AsyncWrite` that tees every write to a file and a capped in-memory
/// buffer, tracking whether the buffer's limit was ever exceeded.
pub struct CappedWriter {
    file: tokio::fs::File,
    buffer: Arc<Mutex<Vec<u8>>>,
    limit: usize,
    exceeded: Arc<Mutex<bool>>,
}

impl AsyncWrite for CappedWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        {
            let mut buffer = this.buffer.lock().unwrap();
            if this.limit == 0 {
                buffer.extend_from_slice(buf);
            } else {
                if buffer.len() + buf.len() > this.limit {
                    *this.exceeded.lock().unwrap() = true;
                }
                let room = this.limit.saturating_sub(buffer.len());
                let take = room.min(buf.len());
                buffer.extend_from_slice(&buf[..take]);
            }
        }
        Pin::new(&mut this.file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

/// Owns a node's log file paths and captured-output buffers for one
/// attempt. A fresh coordinator is built per attempt so retries don't mix
/// captured output across attempts.
pub struct OutputCoordinator {
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    max_output_size: usize,
    stdout_buffer: Arc<Mutex<Vec<u8>>>,
    stderr_buffer: Arc<Mutex<Vec<u8>>>,
    stdout_exceeded: Arc<Mutex<bool>>,
    stderr_exceeded: Arc<Mutex<bool>>,
}

impl OutputCoordinator {
    pub fn new(stdout_path: PathBuf, stderr_path: PathBuf, max_output_size: usize) -> Self {
        Self {
            stdout_path,
            stderr_path,
            max_output_size,
            stdout_buffer: Arc::new(Mutex::new(Vec::new())),
            stderr_buffer: Arc::new(Mutex::new(Vec::new())),
            stdout_exceeded: Arc::new(Mutex::new(false)),
            stderr_exceeded: Arc::new(Mutex::new(false)),
        }
    }

    /// Create the log directory (mode 0750) if absent, per spec.md §4.2
    /// Prepare step 2.
    pub async fn ensure_log_dir(dir: &Path) -> Result<(), Error> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::SetupFailed(format!("cannot create log directory {}: {e}", dir.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o750);
            let _ = std::fs::set_permissions(dir, perms);
        }
        Ok(())
    }

    /// Open both log files and return writer pairs ready to hand to a
    /// [`nodes::OutputSinks`].
    pub async fn open(&self) -> Result<(CappedWriter, CappedWriter), Error> {
        let stdout_file = tokio::fs::File::create(&self.stdout_path)
            .await
            .map_err(|e| Error::SetupFailed(format!("cannot create {}: {e}", self.stdout_path.display())))?;
        let stderr_file = tokio::fs::File::create(&self.stderr_path)
            .await
            .map_err(|e| Error::SetupFailed(format!("cannot create {}: {e}", self.stderr_path.display())))?;

        Ok((
            CappedWriter {
                file: stdout_file,
                buffer: self.stdout_buffer.clone(),
                limit: self.max_output_size,
                exceeded: self.stdout_exceeded.clone(),
            },
            CappedWriter {
                file: stderr_file,
                buffer: self.stderr_buffer.clone(),
                limit: self.max_output_size,
                exceeded: self.stderr_exceeded.clone(),
            },
        ))
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    /// Captured stdout, bounded by `MaxOutputSize` (spec.md §4.2 step 6).
    pub fn captured_stdout(&self) -> Result<String, Error> {
        if *self.stdout_exceeded.lock().unwrap() {
            return Err(Error::OutputExceededLimit(self.max_output_size));
        }
        Ok(String::from_utf8_lossy(&self.stdout_buffer.lock().unwrap()).into_owned())
    }

    /// Whether any of `patterns` matches captured stdout or stderr (spec.md
    /// §4.2 `ShouldContinue` table: "regex may match stdout or stderr file").
    pub fn matches_output_pattern(&self, patterns: &[String]) -> bool {
        let stdout = String::from_utf8_lossy(&self.stdout_buffer.lock().unwrap()).into_owned();
        let stderr = String::from_utf8_lossy(&self.stderr_buffer.lock().unwrap()).into_owned();
        patterns.iter().any(|p| {
            let pattern = p.strip_prefix("re:").unwrap_or(p);
            Regex::new(pattern).map(|re| re.is_match(&stdout) || re.is_match(&stderr)).unwrap_or(false)
        })
    }
}

/// Build the default log file paths for a step attempt (spec.md §4.2
/// Prepare step 1): `<logDir>/<safeName>.<timestamp>.<runIDPrefix>.{out,err}`.
pub fn default_log_paths(
    log_dir: &Path,
    step_name: &str,
    timestamp: &str,
    dag_run_id: &str,
) -> (PathBuf, PathBuf) {
    let safe = safe_name(step_name);
    let run_prefix = &dag_run_id[..dag_run_id.len().min(8)];
    let stdout = log_dir.join(format!("{safe}.{timestamp}.{run_prefix}.out"));
    let stderr = log_dir.join(format!("{safe}.{timestamp}.{run_prefix}.err"));
    (stdout, stderr)
}

/// Build the single merged log path used when `Stdout == Stderr` (merged
/// log mode, spec.md §4.2 Prepare step 1).
pub fn merged_log_path(log_dir: &Path, step_name: &str, timestamp: &str, dag_run_id: &str) -> PathBuf {
    let safe = safe_name(step_name);
    let run_prefix = &dag_run_id[..dag_run_id.len().min(8)];
    log_dir.join(format!("{safe}.{timestamp}.{run_prefix}.log"))
}

fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
