//! User and email-verification types
//!
//! Users are identified by their unique username. A user starts unverified;
//! the verification flow creates `VerifyEmail` rows holding a one-time secret
//! code, and consuming a valid code flips the user's verified flag.

use super::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Verification record identifier
pub type VerifyEmailId = i64;

/// Role of a user within the bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A customer who deposits money; may only manage their own data
    #[default]
    Depositor,

    /// A bank employee in charge of customer service; may manage any user
    Banker,
}

impl Role {
    /// Storage representation of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Depositor => "depositor",
            Role::Banker => "banker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "depositor" => Ok(Role::Depositor),
            "banker" => Ok(Role::Banker),
            other => Err(LedgerError::Internal(format!("unknown role '{}'", other))),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Registered user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    /// Unique username (primary identity)
    pub username: String,

    #[sqlx(try_from = "String")]
    pub role: Role,

    /// Password hash produced by the (external) credential service
    #[serde(skip_serializing)]
    pub hashed_password: String,

    pub full_name: String,

    /// Unique email address
    pub email: String,

    /// Set exactly once, when a verification code is consumed
    pub is_email_verified: bool,

    pub password_changed_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
}

/// Parameters for registering a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub role: Role,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

impl NewUser {
    /// Create registration parameters for a depositor
    pub fn depositor(
        username: impl Into<String>,
        hashed_password: impl Into<String>,
        full_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        NewUser {
            username: username.into(),
            role: Role::Depositor,
            hashed_password: hashed_password.into(),
            full_name: full_name.into(),
            email: email.into(),
        }
    }
}

/// Partial update of a user row
///
/// `None` fields keep their current value. Changing the password also
/// refreshes `password_changed_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub hashed_password: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub is_email_verified: Option<bool>,
}

impl UserUpdate {
    /// Update that only marks the email as verified
    pub fn verified() -> Self {
        UserUpdate {
            is_email_verified: Some(true),
            ..Default::default()
        }
    }
}

/// One-time email verification record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VerifyEmail {
    pub id: VerifyEmailId,

    /// Username of the user being verified
    pub username: String,

    /// Address the code was sent to
    pub email: String,

    /// High-entropy secret embedded in the verification link
    #[serde(skip_serializing)]
    pub secret_code: String,

    /// Whether the code has already been consumed
    pub is_used: bool,

    pub created_at: DateTime<Utc>,

    /// Codes presented after this instant are rejected
    pub expired_at: DateTime<Utc>,
}

/// Parameters for creating a verification record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVerifyEmail {
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub expired_at: DateTime<Utc>,
}

/// Input for finalizing an email verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEmailTxParams {
    pub email_id: VerifyEmailId,
    pub secret_code: String,
}

/// Rows touched by a successful email verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}
