//! `email:verify` task: payload and handler
//!
//! The handler creates a one-time verification record for the user and mails
//! them a link carrying the record id and secret code. The record is
//! committed before the mail is sent; a retried attempt creates a fresh
//! record, and any of them can be used to verify.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::processor::TaskHandler;
use super::task::{Task, TaskError};
use crate::core::execute_in_transaction;
use crate::mail::{Email, EmailSender, MailError};
use crate::store::{Queries, Store};
use crate::types::{ErrorKind, LedgerError, NewVerifyEmail, VerifyEmail};

/// Payload of an `email:verify` task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

/// Settings for verification records and links
#[derive(Debug, Clone)]
pub struct VerifyEmailConfig {
    /// Endpoint the link points at; `email_id` and `secret_code` are appended
    pub base_url: String,
    /// Length of the generated secret code
    pub code_length: usize,
    /// How long a code stays valid
    pub ttl: Duration,
}

impl Default for VerifyEmailConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1/verify_email".to_string(),
            code_length: 32,
            ttl: Duration::minutes(15),
        }
    }
}

/// Random alphanumeric secret of `length` characters
pub fn random_secret_code(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Handler for `email:verify` tasks
#[derive(Debug)]
pub struct SendVerifyEmailHandler<S, M: ?Sized> {
    store: Arc<S>,
    mailer: Arc<M>,
    config: VerifyEmailConfig,
}

impl<S: Store, M: EmailSender + ?Sized> SendVerifyEmailHandler<S, M> {
    pub fn new(store: Arc<S>, mailer: Arc<M>, config: VerifyEmailConfig) -> Self {
        Self {
            store,
            mailer,
            config,
        }
    }

    fn render(&self, full_name: &str, verify_email: &VerifyEmail) -> Email {
        let link = format!(
            "{}?email_id={}&secret_code={}",
            self.config.base_url, verify_email.id, verify_email.secret_code
        );
        Email {
            subject: "Welcome to Simple Bank".to_string(),
            html_body: format!(
                "Hello {},<br/>\
                 Thank you for registering with us!<br/>\
                 Please <a href=\"{}\">click here</a> to verify your email address.<br/>",
                full_name, link
            ),
            to: vec![verify_email.email.clone()],
            ..Default::default()
        }
    }
}

#[async_trait]
impl<S: Store, M: EmailSender + ?Sized> TaskHandler for SendVerifyEmailHandler<S, M> {
    async fn process(&self, task: &Task) -> Result<(), TaskError> {
        let payload: PayloadSendVerifyEmail = serde_json::from_slice(&task.payload)
            .map_err(|e| TaskError::SkipRetry(format!("failed to unmarshal payload: {}", e)))?;

        let username = payload.username;
        let secret_code = random_secret_code(self.config.code_length);
        let expired_at = Utc::now() + self.config.ttl;

        let (full_name, verify_email) = execute_in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                let user = tx.get_user(&username).await?;
                let verify_email = tx
                    .create_verify_email(NewVerifyEmail {
                        username: user.username,
                        email: user.email,
                        secret_code,
                        expired_at,
                    })
                    .await?;
                Ok::<_, LedgerError>((user.full_name, verify_email))
            })
        })
        .await
        .map_err(|error| match error.kind() {
            ErrorKind::NotFound => TaskError::SkipRetry(format!("user does not exist: {}", error)),
            _ => TaskError::from(error),
        })?;

        let email = self.render(&full_name, &verify_email);
        self.mailer.send_email(email).await.map_err(|error| match error {
            MailError::Transport(_) => TaskError::Retry(error.to_string()),
            MailError::Rejected(_) => TaskError::SkipRetry(error.to_string()),
        })?;

        tracing::info!(
            task_id = task.id,
            username = %verify_email.username,
            email = %verify_email.email,
            verify_email_id = verify_email.id,
            "processed task"
        );
        Ok(())
    }
}
