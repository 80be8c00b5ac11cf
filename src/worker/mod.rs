//! Background task queue
//!
//! This module delivers side effects that must not run inside a database
//! transaction:
//! - `task` - Task kinds, queue names, options and handler outcomes
//! - `broker` - Broker trait and the in-process `MemoryBroker`
//! - `distributor` - Producer that serializes and enqueues tasks
//! - `processor` - Weighted multi-queue consumer with retry and dead-lettering
//! - `send_verify_email` - The `email:verify` payload and handler
//! - `runtime` - The long-running worker process wiring them together

pub mod broker;
pub mod distributor;
pub mod processor;
pub mod runtime;
pub mod send_verify_email;
pub mod task;

pub use broker::{
    ArchivedTask, Broker, BrokerError, BrokerStats, MemoryBroker, MemoryBrokerConfig,
    RetryOutcome, TaskState,
};
pub use distributor::TaskDistributor;
pub use processor::{
    ErrorObserver, Handlers, LogObserver, ProcessorConfig, RetryPolicy, TaskHandler,
    TaskProcessor, WeightedSchedule,
};
pub use runtime::{run_worker, RegistrationSummary, WorkerConfig};
pub use send_verify_email::{
    random_secret_code, PayloadSendVerifyEmail, SendVerifyEmailHandler, VerifyEmailConfig,
};
pub use task::{
    LeaseId, NewTask, QueueName, Task, TaskError, TaskId, TaskInfo, TaskKind, TaskOptions,
};
