//! User registration with a transactional outbox
//!
//! Registering a user inserts the user row and, inside the same transaction,
//! runs an after-create hook. The sanctioned hook enqueues the
//! `email:verify` task. If the hook fails the user row is rolled back, so a
//! registration either produces a user and a task, or neither.
//!
//! The enqueue happens before the commit. If the commit itself fails after
//! the broker accepted the task, the task refers to a user that does not
//! exist; the verification handler treats a missing user as a permanent
//! failure and archives the task.

use std::future::Future;
use std::sync::Arc;

use crate::store::{Queries, Store};
use crate::types::{LedgerError, NewUser, User};
use crate::worker::{PayloadSendVerifyEmail, TaskDistributor, TaskOptions};

use super::unit_of_work::execute_in_transaction;

/// Insert a user and run `after_create` in the same transaction
///
/// # Arguments
///
/// * `store` - Store to register the user in
/// * `user` - Registration parameters
/// * `after_create` - Hook receiving the inserted row; an error aborts the
///   registration
///
/// # Returns
///
/// * `Ok(User)` - The committed user
/// * `Err(LedgerError::Conflict)` - If the username or email is taken
/// * `Err(e)` - Whatever the hook returned, after rolling back
pub async fn create_user_tx<S, H, Fut>(
    store: &S,
    user: NewUser,
    after_create: H,
) -> Result<User, LedgerError>
where
    S: Store,
    H: FnOnce(User) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), LedgerError>> + Send + 'static,
{
    execute_in_transaction(store, move |tx| {
        Box::pin(async move {
            let user = tx.create_user(user).await?;
            after_create(user.clone()).await?;
            Ok::<_, LedgerError>(user)
        })
    })
    .await
}

/// Registration service wiring the outbox hook to the task producer
#[derive(Debug)]
pub struct Registration<S> {
    store: Arc<S>,
    distributor: TaskDistributor,
}

impl<S> Clone for Registration<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            distributor: self.distributor.clone(),
        }
    }
}

impl<S: Store> Registration<S> {
    pub fn new(store: Arc<S>, distributor: TaskDistributor) -> Self {
        Self { store, distributor }
    }

    /// Register a user and schedule their verification email
    ///
    /// The task goes to the critical queue, runs no earlier than ten seconds
    /// after the enqueue and is retried at most ten times.
    ///
    /// # Errors
    ///
    /// * `Conflict` - username or email already registered
    /// * `Transient` - the broker could not accept the task; no user was created
    pub async fn register(&self, user: NewUser) -> Result<User, LedgerError> {
        let distributor = self.distributor.clone();
        let user = create_user_tx(self.store.as_ref(), user, move |user: User| async move {
            let payload = PayloadSendVerifyEmail {
                username: user.username,
            };
            distributor
                .distribute_send_verify_email(&payload, TaskOptions::verification())
                .await?;
            Ok::<_, LedgerError>(())
        })
        .await?;

        tracing::info!(username = %user.username, "user registered");
        Ok(user)
    }
}
