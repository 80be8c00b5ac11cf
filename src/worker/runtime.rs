//! Long-running worker process
//!
//! Wires the in-process broker, the verification email handler and the
//! consumer together, then optionally registers users from a CSV file so
//! their verification emails flow through the outbox while the consumer is
//! running. The process stops when the shutdown token is cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::broker::{Broker, MemoryBroker};
use super::distributor::TaskDistributor;
use super::processor::{Handlers, ProcessorConfig, TaskProcessor};
use super::send_verify_email::{SendVerifyEmailHandler, VerifyEmailConfig};
use crate::core::Registration;
use crate::io::{SyncReader, UserCsvRecord};
use crate::mail::EmailSender;
use crate::store::Store;

/// Worker process configuration
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub processor: ProcessorConfig,
    pub verify_email: VerifyEmailConfig,
    /// Users to register once the consumer is up
    pub users_file: Option<PathBuf>,
}

/// Counters for the startup registrations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationSummary {
    pub registered: usize,
    pub rejected: usize,
}

/// Run the task consumer until `shutdown` is cancelled
///
/// # Arguments
///
/// * `store` - Store the handler reads users from and writes codes to
/// * `mailer` - Transport for verification emails
/// * `config` - Consumer, link and registration settings
/// * `shutdown` - Cancelled to stop the consumer
///
/// # Returns
///
/// * `Ok(RegistrationSummary)` - Once the consumer has drained its workers
/// * `Err(String)` - If the users file cannot be opened or a worker
///   could not be joined
pub async fn run_worker<S: Store>(
    store: Arc<S>,
    mailer: Arc<dyn EmailSender>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> Result<RegistrationSummary, String> {
    let users = config
        .users_file
        .as_deref()
        .map(SyncReader::<UserCsvRecord>::new)
        .transpose()?;

    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let handler = SendVerifyEmailHandler::new(Arc::clone(&store), mailer, config.verify_email);
    let processor = TaskProcessor::new(
        Arc::clone(&broker),
        Handlers {
            send_verify_email: Arc::new(handler),
        },
        config.processor,
    );

    let consumer = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { processor.run(shutdown).await })
    };
    tracing::info!("task processor started");

    let mut summary = RegistrationSummary::default();
    if let Some(users) = users {
        let registration = Registration::new(store, TaskDistributor::new(broker));
        for user in users {
            if shutdown.is_cancelled() {
                break;
            }
            let outcome = match user {
                Ok(user) => registration.register(user).await.map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) => summary.registered += 1,
                Err(error) => {
                    summary.rejected += 1;
                    tracing::warn!(%error, "registration rejected");
                }
            }
        }
        tracing::info!(
            registered = summary.registered,
            rejected = summary.rejected,
            "startup registrations done"
        );
    }

    consumer
        .await
        .map_err(|e| format!("Task processor failed: {}", e))?;
    Ok(summary)
}
