//! Task consumer
//!
//! `TaskProcessor` runs a pool of workers that lease tasks from the broker,
//! dispatch them to the registered handler and settle the outcome.
//!
//! # Queue Selection
//!
//! Each worker walks the queues in smooth weighted round-robin order
//! (critical 10, default 5 by default): over fifteen polls critical is tried
//! first ten times and default five times, interleaved. When the preferred
//! queue is empty the worker falls through to the others, so a lower-weight
//! queue is never starved while a higher one is idle.
//!
//! # Settlement
//!
//! - success: `ack`
//! - `TaskError::Retry`: `retry` after exponential backoff; the broker
//!   archives instead once the task has no retries left
//! - `TaskError::SkipRetry`: `archive`
//!
//! Every archive is reported to the [`ErrorObserver`], including tasks the
//! broker archived itself after a lease ran out with no retries left. A
//! settlement refused because the lease was lost is logged and dropped; the
//! task already belongs to another delivery.
//!
//! A task exceeding the per-task deadline, or interrupted by shutdown, is
//! treated as a retryable failure.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::broker::{Broker, BrokerError, RetryOutcome};
use super::task::{QueueName, Task, TaskError, TaskKind};

/// Runs one type of task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process(&self, task: &Task) -> Result<(), TaskError>;
}

/// Receives every task that failed for good
pub trait ErrorObserver: Send + Sync {
    fn on_failure(&self, task: &Task, error: &TaskError);
}

/// Observer that logs terminal failures
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ErrorObserver for LogObserver {
    fn on_failure(&self, task: &Task, error: &TaskError) {
        tracing::error!(
            task_id = task.id,
            task_type = %task.kind,
            payload = %String::from_utf8_lossy(&task.payload),
            retried = task.retried,
            %error,
            "process task failed"
        );
    }
}

/// Handler registry, one field per [`TaskKind`]
#[derive(Clone)]
pub struct Handlers {
    pub send_verify_email: Arc<dyn TaskHandler>,
}

impl Handlers {
    fn handler_for(&self, kind: TaskKind) -> &dyn TaskHandler {
        match kind {
            TaskKind::SendVerifyEmail => self.send_verify_email.as_ref(),
        }
    }
}

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts already failed
    pub fn delay(&self, retried: u32) -> Duration {
        let factor = 2u32.checked_pow(retried).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Consumer configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Queues and their weights
    pub queues: Vec<(QueueName, u32)>,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Idle wait when every queue is empty
    pub poll_interval: Duration,
    /// Deadline for a single attempt; keep it below the broker lease
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queues: vec![(QueueName::Critical, 10), (QueueName::Default, 5)],
            concurrency: num_cpus::get(),
            poll_interval: Duration::from_millis(100),
            task_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Smooth weighted round-robin over the configured queues
#[derive(Debug, Clone)]
pub struct WeightedSchedule {
    queues: Vec<(QueueName, i64, i64)>,
}

impl WeightedSchedule {
    pub fn new(queues: &[(QueueName, u32)]) -> Self {
        Self {
            queues: queues
                .iter()
                .filter(|(_, weight)| *weight > 0)
                .map(|(queue, weight)| (*queue, i64::from(*weight), 0))
                .collect(),
        }
    }

    /// Queues to try for the next poll, preferred queue first
    pub fn next_order(&mut self) -> Vec<QueueName> {
        let total: i64 = self.queues.iter().map(|(_, weight, _)| weight).sum();
        for (_, weight, current) in self.queues.iter_mut() {
            *current += *weight;
        }

        let Some(picked) = self
            .queues
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.2.cmp(&b.2).then(ib.cmp(ia)))
            .map(|(index, _)| index)
        else {
            return Vec::new();
        };
        self.queues[picked].2 -= total;

        let mut order = vec![self.queues[picked].0];
        order.extend(
            self.queues
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != picked)
                .map(|(_, (queue, _, _))| *queue),
        );
        order
    }
}

/// Consumer side of the task queue
#[derive(Clone)]
pub struct TaskProcessor {
    broker: Arc<dyn Broker>,
    handlers: Handlers,
    observer: Arc<dyn ErrorObserver>,
    config: ProcessorConfig,
}

impl TaskProcessor {
    /// Create a new TaskProcessor reporting failures to [`LogObserver`]
    pub fn new(broker: Arc<dyn Broker>, handlers: Handlers, config: ProcessorConfig) -> Self {
        Self {
            broker,
            handlers,
            observer: Arc::new(LogObserver),
            config,
        }
    }

    /// Replace the terminal failure observer
    pub fn with_observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run the worker pool until `shutdown` is cancelled
    ///
    /// An attempt in flight when shutdown is requested is abandoned and
    /// scheduled for retry.
    pub async fn run(&self, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        tracing::info!(concurrency, "task processor starting");

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let processor = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { processor.work_loop(worker_id, shutdown).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(error) = result {
                tracing::error!(%error, "task worker panicked");
            }
        }
        tracing::info!("task processor stopped");
    }

    async fn work_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        let mut schedule = WeightedSchedule::new(&self.config.queues);
        while !shutdown.is_cancelled() {
            let idle = match self.process_next(&mut schedule, &shutdown).await {
                Ok(processed) => !processed,
                Err(error) => {
                    tracing::warn!(worker_id, %error, "broker call failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        tracing::debug!(worker_id, "task worker exiting");
    }

    /// Lease, run and settle at most one task
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - A task was processed (whatever its outcome)
    /// * `Ok(false)` - Every queue was empty
    /// * `Err(BrokerError)` - The broker could not be reached
    pub async fn process_next(
        &self,
        schedule: &mut WeightedSchedule,
        shutdown: &CancellationToken,
    ) -> Result<bool, BrokerError> {
        for lost in self.broker.take_expired().await? {
            self.observer.on_failure(&lost.task, &TaskError::Retry(lost.error));
        }

        for queue in schedule.next_order() {
            if let Some(task) = self.broker.dequeue(queue).await? {
                let outcome = self.execute(&task, shutdown).await;
                match self.settle(&task, outcome).await {
                    Ok(()) => {}
                    Err(BrokerError::NotActive(id)) => {
                        tracing::warn!(
                            task_id = id,
                            lease = task.lease,
                            "task lease lost before settlement, outcome discarded"
                        );
                    }
                    Err(error) => return Err(error),
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn execute(&self, task: &Task, shutdown: &CancellationToken) -> Result<(), TaskError> {
        let handler = self.handlers.handler_for(task.kind);
        let deadline = self.config.task_timeout;

        tokio::select! {
            result = tokio::time::timeout(deadline, handler.process(task)) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(TaskError::Retry(format!("task exceeded deadline of {:?}", deadline))),
            },
            _ = shutdown.cancelled() => Err(TaskError::Retry("worker shutting down".to_string())),
        }
    }

    async fn settle(&self, task: &Task, outcome: Result<(), TaskError>) -> Result<(), BrokerError> {
        match outcome {
            Ok(()) => {
                self.broker.ack(task.id, task.lease).await?;
                tracing::debug!(task_id = task.id, task_type = %task.kind, "task completed");
            }
            Err(error) if error.is_retryable() => {
                let delay = self.config.retry.delay(task.retried);
                let retried = self
                    .broker
                    .retry(task.id, task.lease, delay, &error.to_string())
                    .await?;
                match retried {
                    RetryOutcome::Scheduled => tracing::warn!(
                        task_id = task.id,
                        task_type = %task.kind,
                        retried = task.retried,
                        ?delay,
                        %error,
                        "task failed, will retry"
                    ),
                    RetryOutcome::Archived => self.observer.on_failure(task, &error),
                }
            }
            Err(error) => {
                self.broker
                    .archive(task.id, task.lease, &error.to_string())
                    .await?;
                self.observer.on_failure(task, &error);
            }
        }
        Ok(())
    }
}
