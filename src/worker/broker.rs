//! Task broker abstraction and an in-process implementation
//!
//! The broker owns in-flight task state. Producers enqueue, workers dequeue a
//! task (which leases it), run it and settle it with `ack`, `retry` or
//! `archive`.
//!
//! # Task Lifecycle
//!
//! ```text
//! Scheduled --(delay elapses)--> Pending --(dequeue)--> Active
//! Active --ack--> Completed
//! Active --retry--> Retry --(backoff elapses)--> Pending
//! Active --archive--> Archived
//! Active --(lease expires)--> Pending, or Archived once retries are spent
//! ```
//!
//! A worker that dies mid-task never settles it; the lease expiring puts the
//! task back in line, so delivery is at least once.
//!
//! Every delivery carries a fresh [`LeaseId`]. Settling calls must present
//! the lease they were handed; once a lease has run out, its holder can no
//! longer settle the task and gets `NotActive`. Whether a retry is still
//! allowed is decided from the broker's own attempt count.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::task::{LeaseId, NewTask, QueueName, Task, TaskId, TaskInfo};
use crate::types::LedgerError;

/// Errors reported by a broker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker cannot be reached right now
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The task is not active under the presented lease, so it cannot be settled
    #[error("task {0} is not active")]
    NotActive(TaskId),
}

/// What `retry` did with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Another attempt is scheduled
    Scheduled,
    /// No retries were left; the task is archived
    Archived,
}

impl From<BrokerError> for LedgerError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::Unavailable(_) => LedgerError::Transient(error.to_string()),
            BrokerError::NotActive(_) => LedgerError::Internal(error.to_string()),
        }
    }
}

/// Durable priority queues with delay and retry bookkeeping
#[async_trait]
pub trait Broker: fmt::Debug + Send + Sync {
    /// Accept a task for later delivery
    async fn enqueue(&self, task: NewTask) -> Result<TaskInfo, BrokerError>;

    /// Lease the next deliverable task on `queue`, if any
    async fn dequeue(&self, queue: QueueName) -> Result<Option<Task>, BrokerError>;

    /// Mark a task leased under `lease` completed
    async fn ack(&self, id: TaskId, lease: LeaseId) -> Result<(), BrokerError>;

    /// Schedule another attempt after `delay`, or archive the task when its
    /// retries are spent
    async fn retry(
        &self,
        id: TaskId,
        lease: LeaseId,
        delay: Duration,
        error: &str,
    ) -> Result<RetryOutcome, BrokerError>;

    /// Move a task leased under `lease` to the dead-letter set
    async fn archive(&self, id: TaskId, lease: LeaseId, error: &str) -> Result<(), BrokerError>;

    /// Tasks the broker archived itself because a lease ran out with no
    /// retries left
    ///
    /// Each such task is returned by exactly one call, so the consumer can
    /// report it as a terminal failure.
    async fn take_expired(&self) -> Result<Vec<ArchivedTask>, BrokerError>;
}

/// Lifecycle state of a task held by [`MemoryBroker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Scheduled,
    Pending,
    Active,
    Retry,
    Archived,
}

/// Task counts per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub scheduled: usize,
    pub pending: usize,
    pub active: usize,
    pub retry: usize,
    pub archived: usize,
    pub completed: u64,
}

/// A dead-lettered task and the error that sent it there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedTask {
    pub task: Task,
    pub error: String,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryBrokerConfig {
    /// How long a dequeued task stays leased to its worker
    ///
    /// Keep it longer than the consumer's per-task deadline, otherwise a
    /// slow attempt loses its lease before it can report.
    pub lease: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Slot {
    task: Task,
    state: TaskState,
    ready_at: Instant,
    lease_until: Option<Instant>,
    last_error: Option<String>,
}

impl Slot {
    fn deliverable(&self, now: Instant) -> bool {
        matches!(
            self.state,
            TaskState::Scheduled | TaskState::Pending | TaskState::Retry
        ) && self.ready_at <= now
    }
}

#[derive(Debug, Default)]
struct State {
    available: bool,
    next_id: TaskId,
    slots: BTreeMap<TaskId, Slot>,
    completed: u64,
    /// Archived on lease expiry and not yet handed to a consumer
    expired: Vec<ArchivedTask>,
}

impl State {
    /// Return tasks whose lease ran out to the queue, counting the lost attempt
    fn recover_expired(&mut self, now: Instant) {
        let expired = &mut self.expired;
        for (id, slot) in self.slots.iter_mut() {
            let lease_ran_out = slot.state == TaskState::Active
                && slot.lease_until.is_some_and(|until| until <= now);
            if !lease_ran_out {
                continue;
            }

            slot.lease_until = None;
            slot.last_error = Some("lease expired".to_string());
            if slot.task.retried < slot.task.max_retry {
                slot.task.retried += 1;
                slot.state = TaskState::Pending;
                slot.ready_at = now;
                tracing::warn!(task_id = id, "task lease expired, requeued");
            } else {
                slot.state = TaskState::Archived;
                expired.push(ArchivedTask {
                    task: slot.task.clone(),
                    error: "lease expired".to_string(),
                });
                tracing::warn!(task_id = id, "task lease expired, retries exhausted");
            }
        }
    }

    /// The slot of a task still leased under `lease`
    fn leased_slot(
        &mut self,
        id: TaskId,
        lease: LeaseId,
        now: Instant,
    ) -> Result<&mut Slot, BrokerError> {
        self.recover_expired(now);
        self.slots
            .get_mut(&id)
            .filter(|slot| slot.state == TaskState::Active && slot.task.lease == lease)
            .ok_or(BrokerError::NotActive(id))
    }
}

/// In-process broker
///
/// Time is read from `tokio::time`, so tests running with a paused clock
/// control delays, backoff and lease expiry.
#[derive(Debug)]
pub struct MemoryBroker {
    config: MemoryBrokerConfig,
    state: Mutex<State>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_config(MemoryBrokerConfig::default())
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryBrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                available: true,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate an outage; every call fails with `Unavailable` while `false`
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Tasks not yet completed or archived, in id order
    pub fn tasks(&self) -> Vec<Task> {
        self.state()
            .slots
            .values()
            .filter(|slot| slot.state != TaskState::Archived)
            .map(|slot| slot.task.clone())
            .collect()
    }

    /// Dead-lettered tasks, in id order
    pub fn archived(&self) -> Vec<ArchivedTask> {
        self.state()
            .slots
            .values()
            .filter(|slot| slot.state == TaskState::Archived)
            .map(|slot| ArchivedTask {
                task: slot.task.clone(),
                error: slot.last_error.clone().unwrap_or_default(),
            })
            .collect()
    }

    /// Current state of a task; `None` once completed or if never enqueued
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        let now = Instant::now();
        self.state().slots.get(&id).map(|slot| {
            if slot.state == TaskState::Scheduled && slot.ready_at <= now {
                TaskState::Pending
            } else {
                slot.state
            }
        })
    }

    pub fn stats(&self) -> BrokerStats {
        let now = Instant::now();
        let state = self.state();
        let mut stats = BrokerStats {
            completed: state.completed,
            ..Default::default()
        };
        for slot in state.slots.values() {
            match slot.state {
                TaskState::Scheduled if slot.ready_at <= now => stats.pending += 1,
                TaskState::Scheduled => stats.scheduled += 1,
                TaskState::Pending => stats.pending += 1,
                TaskState::Active => stats.active += 1,
                TaskState::Retry => stats.retry += 1,
                TaskState::Archived => stats.archived += 1,
            }
        }
        stats
    }

    fn guard_available(state: &State) -> Result<(), BrokerError> {
        if state.available {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker is offline".to_string()))
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task: NewTask) -> Result<TaskInfo, BrokerError> {
        let now = Instant::now();
        let mut state = self.state();
        Self::guard_available(&state)?;

        state.next_id += 1;
        let id = state.next_id;
        let process_at = now + task.options.process_in;
        let slot = Slot {
            task: Task {
                id,
                kind: task.kind,
                payload: task.payload,
                queue: task.options.queue,
                max_retry: task.options.max_retry,
                retried: 0,
                lease: 0,
            },
            state: if task.options.process_in.is_zero() {
                TaskState::Pending
            } else {
                TaskState::Scheduled
            },
            ready_at: process_at,
            lease_until: None,
            last_error: None,
        };
        state.slots.insert(id, slot);

        Ok(TaskInfo {
            id,
            kind: task.kind,
            queue: task.options.queue,
            max_retry: task.options.max_retry,
            process_at,
        })
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<Task>, BrokerError> {
        let now = Instant::now();
        let mut state = self.state();
        Self::guard_available(&state)?;
        state.recover_expired(now);

        let next = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.task.queue == queue && slot.deliverable(now))
            .min_by_key(|(id, slot)| (slot.ready_at, **id))
            .map(|(id, _)| *id);

        let Some(id) = next else {
            return Ok(None);
        };
        let lease = self.config.lease;
        Ok(state.slots.get_mut(&id).map(|slot| {
            slot.state = TaskState::Active;
            slot.lease_until = Some(now + lease);
            slot.task.lease += 1;
            slot.task.clone()
        }))
    }

    async fn ack(&self, id: TaskId, lease: LeaseId) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut state = self.state();
        Self::guard_available(&state)?;
        state.leased_slot(id, lease, now)?;
        state.slots.remove(&id);
        state.completed += 1;
        Ok(())
    }

    async fn retry(
        &self,
        id: TaskId,
        lease: LeaseId,
        delay: Duration,
        error: &str,
    ) -> Result<RetryOutcome, BrokerError> {
        let now = Instant::now();
        let mut state = self.state();
        Self::guard_available(&state)?;
        let slot = state.leased_slot(id, lease, now)?;
        slot.lease_until = None;
        slot.last_error = Some(error.to_string());

        if slot.task.retried >= slot.task.max_retry {
            slot.state = TaskState::Archived;
            return Ok(RetryOutcome::Archived);
        }
        slot.state = TaskState::Retry;
        slot.task.retried += 1;
        slot.ready_at = now + delay;
        Ok(RetryOutcome::Scheduled)
    }

    async fn archive(&self, id: TaskId, lease: LeaseId, error: &str) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut state = self.state();
        Self::guard_available(&state)?;
        let slot = state.leased_slot(id, lease, now)?;
        slot.state = TaskState::Archived;
        slot.lease_until = None;
        slot.last_error = Some(error.to_string());
        Ok(())
    }

    async fn take_expired(&self) -> Result<Vec<ArchivedTask>, BrokerError> {
        let now = Instant::now();
        let mut state = self.state();
        Self::guard_available(&state)?;
        state.recover_expired(now);
        Ok(std::mem::take(&mut state.expired))
    }
}
