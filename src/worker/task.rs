//! Task types shared by the producer, the broker and the consumer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::types::{ErrorKind, LedgerError};

/// Task identifier assigned by the broker
pub type TaskId = u64;

/// Delivery generation of a task; bumped every time the broker leases it
pub type LeaseId = u64;

/// Closed set of task types the consumer knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// Create a verification record and mail the link to the user
    #[serde(rename = "email:verify")]
    SendVerifyEmail,
}

impl TaskKind {
    /// Type tag carried on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SendVerifyEmail => "email:verify",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email:verify" => Ok(TaskKind::SendVerifyEmail),
            other => Err(LedgerError::Permanent(format!("unknown task type '{}'", other))),
        }
    }
}

/// Priority queue a task is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Critical,
    #[default]
    Default,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Critical => "critical",
            QueueName::Default => "default",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery options chosen by the producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: QueueName,
    /// Retries allowed after the first attempt
    pub max_retry: u32,
    /// Delay before the first attempt
    pub process_in: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            queue: QueueName::Default,
            max_retry: 25,
            process_in: Duration::ZERO,
        }
    }
}

impl TaskOptions {
    /// Options used for the registration verification email
    pub fn verification() -> Self {
        Self {
            queue: QueueName::Critical,
            max_retry: 10,
            process_in: Duration::from_secs(10),
        }
    }

    pub fn queue(mut self, queue: QueueName) -> Self {
        self.queue = queue;
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn process_in(mut self, process_in: Duration) -> Self {
        self.process_in = process_in;
        self
    }
}

/// Task as submitted to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub kind: TaskKind,
    /// Serialized payload, opaque to the broker
    pub payload: Vec<u8>,
    pub options: TaskOptions,
}

/// Task as delivered to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: Vec<u8>,
    pub queue: QueueName,
    pub max_retry: u32,
    /// Attempts that already failed
    pub retried: u32,
    /// Lease this copy was delivered under; settling must present it
    pub lease: LeaseId,
}

/// Receipt returned by the broker for an accepted task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub kind: TaskKind,
    pub queue: QueueName,
    pub max_retry: u32,
    /// Earliest instant the task may be delivered
    pub process_at: Instant,
}

/// Outcome a handler reports for a failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The attempt failed but a later one may succeed
    #[error("{0}")]
    Retry(String),

    /// Retrying cannot help; the task is archived immediately
    #[error("{0}: skip retry")]
    SkipRetry(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retry(_))
    }
}

impl From<LedgerError> for TaskError {
    /// Transient and unclassified failures are retried; the rest are final
    fn from(error: LedgerError) -> Self {
        match error.kind() {
            ErrorKind::Transient | ErrorKind::Internal => TaskError::Retry(error.to_string()),
            ErrorKind::NotFound
            | ErrorKind::Conflict
            | ErrorKind::InvalidState
            | ErrorKind::Permanent => TaskError::SkipRetry(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_task_kind_tag() {
        assert_eq!(TaskKind::SendVerifyEmail.as_str(), "email:verify");
        assert_eq!(
            "email:verify".parse::<TaskKind>().unwrap(),
            TaskKind::SendVerifyEmail
        );
        assert_eq!(
            "email:welcome".parse::<TaskKind>().unwrap_err().kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_verification_options() {
        let options = TaskOptions::verification();
        assert_eq!(options.queue, QueueName::Critical);
        assert_eq!(options.max_retry, 10);
        assert_eq!(options.process_in, Duration::from_secs(10));
    }

    #[rstest]
    #[case::transient(LedgerError::Transient("timeout".to_string()), true)]
    #[case::internal(LedgerError::Internal("driver".to_string()), true)]
    #[case::not_found(LedgerError::not_found("user", "ghost"), false)]
    #[case::permanent(LedgerError::Permanent("bad payload".to_string()), false)]
    fn test_ledger_error_classification(#[case] error: LedgerError, #[case] retryable: bool) {
        assert_eq!(TaskError::from(error).is_retryable(), retryable);
    }
}
