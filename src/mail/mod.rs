//! Outbound email capability
//!
//! The ledger only needs to hand a rendered message to a transport; the SMTP
//! client itself lives outside this crate behind [`EmailSender`].

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by a mail transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailError {
    /// Connection, timeout or temporary server failure; sending again may work
    #[error("mail transport failure: {0}")]
    Transport(String),

    /// The message was refused for good (invalid mailbox, blocked sender)
    #[error("mail rejected: {0}")]
    Rejected(String),
}

/// A rendered HTML message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    pub html_body: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

/// Mail transport
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver one message
    ///
    /// # Errors
    ///
    /// * `MailError::Transport` - retryable delivery failure
    /// * `MailError::Rejected` - the message will never be accepted
    async fn send_email(&self, email: Email) -> Result<(), MailError>;
}

/// Sender that only logs messages, for local runs without a mail server
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSender;

#[async_trait]
impl EmailSender for LogSender {
    async fn send_email(&self, email: Email) -> Result<(), MailError> {
        if email.to.is_empty() {
            return Err(MailError::Rejected("message has no recipients".to_string()));
        }
        tracing::info!(
            subject = %email.subject,
            to = ?email.to,
            cc = ?email.cc,
            bcc = email.bcc.len(),
            "email sent"
        );
        Ok(())
    }
}
