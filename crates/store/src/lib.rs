//! `store` crate — the narrow persistence interface the DAG runtime core
//! talks to, per spec.md §1 ("external collaborators, not respecified ...
//! The core talks to these through narrow interfaces") and §6 ("Node state
//! and DAG status are persisted by the external dag-run-store through the
//! `Attempt` interface").
//!
//! This crate intentionally does not implement a real store: the real
//! `dag-run-store`/`proc-store` are out of scope. It carries the trait the
//! core is written against, plus an in-memory implementation used by the
//! demo CLI and by engine integration tests.

pub mod error;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub use error::StoreError;

/// A snapshot of one node's status, as persisted alongside the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusSnapshot {
    pub name: String,
    pub status: String,
    pub exit_code: Option<i32>,
    pub retry_count: u32,
    pub done_count: u32,
    pub error: Option<String>,
}

/// The persisted status of one dag-run, written by the runtime as it makes
/// progress (spec.md §6's `DAGRunStatus`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DagRunStatus {
    pub run_id: String,
    pub dag_name: String,
    pub status: String,
    pub nodes: Vec<NodeStatusSnapshot>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The interface the core talks to the run store through: `Open`, repeated
/// `Write`s as execution progresses, and a final `Close`; plus read-back and
/// an external cancellation request.
#[async_trait]
pub trait Attempt: Send + Sync {
    async fn open(&self) -> Result<(), StoreError>;
    async fn write(&self, status: DagRunStatus) -> Result<(), StoreError>;
    async fn close(&self) -> Result<(), StoreError>;
    async fn read_status(&self) -> Result<Option<DagRunStatus>, StoreError>;
    async fn request_cancel(&self) -> Result<(), StoreError>;
    /// Has an external actor requested cancellation of this run?
    async fn cancel_requested(&self) -> bool;
}

/// A throwaway in-process implementation of [`Attempt`]: keeps the latest
/// status (and a cancel flag) in memory. Good enough for the demo CLI and
/// for tests that assert on what gets written, not for actually surviving a
/// process restart.
#[derive(Default)]
pub struct InMemoryAttempt {
    open: Mutex<bool>,
    latest: Mutex<Option<DagRunStatus>>,
    cancel_requested: Mutex<bool>,
}

impl InMemoryAttempt {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Attempt for InMemoryAttempt {
    async fn open(&self) -> Result<(), StoreError> {
        *self.open.lock().unwrap() = true;
        Ok(())
    }

    async fn write(&self, status: DagRunStatus) -> Result<(), StoreError> {
        if !*self.open.lock().unwrap() {
            return Err(StoreError::NotOpen);
        }
        *self.latest.lock().unwrap() = Some(status);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut open = self.open.lock().unwrap();
        if !*open {
            return Err(StoreError::AlreadyClosed);
        }
        *open = false;
        Ok(())
    }

    async fn read_status(&self) -> Result<Option<DagRunStatus>, StoreError> {
        Ok(self.latest.lock().unwrap().clone())
    }

    async fn request_cancel(&self) -> Result<(), StoreError> {
        *self.cancel_requested.lock().unwrap() = true;
        Ok(())
    }

    async fn cancel_requested(&self) -> bool {
        *self.cancel_requested.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_before_open_fails() {
        let attempt = InMemoryAttempt::new();
        let status = DagRunStatus {
            run_id: "r1".into(),
            dag_name: "d1".into(),
            status: "running".into(),
            nodes: vec![],
            started_at: None,
            finished_at: None,
        };
        assert!(matches!(attempt.write(status).await, Err(StoreError::NotOpen)));
    }

    #[tokio::test]
    async fn round_trips_latest_status() {
        let attempt = InMemoryAttempt::new();
        attempt.open().await.unwrap();
        let status = DagRunStatus {
            run_id: "r1".into(),
            dag_name: "d1".into(),
            status: "succeeded".into(),
            nodes: vec![],
            started_at: None,
            finished_at: None,
        };
        attempt.write(status).await.unwrap();
        let read = attempt.read_status().await.unwrap().unwrap();
        assert_eq!(read.status, "succeeded");
    }

    #[tokio::test]
    async fn cancel_request_is_observable() {
        let attempt = InMemoryAttempt::new();
        assert!(!attempt.cancel_requested().await);
        attempt.request_cancel().await.unwrap();
        assert!(attempt.cancel_requested().await);
    }
}
