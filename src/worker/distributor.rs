//! Task producer
//!
//! `TaskDistributor` serializes payloads and hands tasks to the broker.

use serde::Serialize;
use std::sync::Arc;

use super::broker::Broker;
use super::send_verify_email::PayloadSendVerifyEmail;
use super::task::{NewTask, TaskInfo, TaskKind, TaskOptions};
use crate::types::LedgerError;

/// Producer side of the task queue
#[derive(Debug, Clone)]
pub struct TaskDistributor {
    broker: Arc<dyn Broker>,
}

impl TaskDistributor {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Serialize `payload` and enqueue it as a task of type `kind`
    ///
    /// # Errors
    ///
    /// * `Permanent` - the payload could not be serialized
    /// * `Transient` - the broker did not accept the task
    pub async fn enqueue<P: Serialize + ?Sized>(
        &self,
        kind: TaskKind,
        payload: &P,
        options: TaskOptions,
    ) -> Result<TaskInfo, LedgerError> {
        let payload = serde_json::to_vec(payload).map_err(|e| {
            LedgerError::Permanent(format!("failed to marshal {} payload: {}", kind, e))
        })?;

        let info = self
            .broker
            .enqueue(NewTask {
                kind,
                payload,
                options,
            })
            .await?;

        tracing::info!(
            task_id = info.id,
            task_type = %info.kind,
            queue = %info.queue,
            max_retry = info.max_retry,
            "enqueued task"
        );
        Ok(info)
    }

    /// Enqueue the verification email for a newly registered user
    pub async fn distribute_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        options: TaskOptions,
    ) -> Result<TaskInfo, LedgerError> {
        self.enqueue(TaskKind::SendVerifyEmail, payload, options).await
    }
}
