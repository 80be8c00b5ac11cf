//! Email verification finalizer
//!
//! Consumes a one-time verification code and marks the owning user's email
//! as verified, both in one transaction.

use crate::store::{Queries, Store};
use crate::types::{ErrorKind, LedgerError, UserUpdate, VerifyEmailTxParams, VerifyEmailTxResult};

use super::unit_of_work::execute_in_transaction;

/// Single message for every rejected code
///
/// A wrong id, a wrong secret, a used code and an expired code all look the
/// same to the caller.
pub const INVALID_VERIFICATION: &str = "invalid or expired verification code";

/// Finalize an email verification
///
/// # Arguments
///
/// * `store` - Store holding the verification record
/// * `params` - Record id and secret code taken from the verification link
///
/// # Returns
///
/// * `Ok(VerifyEmailTxResult)` - The verified user and the consumed record
/// * `Err(LedgerError::InvalidState)` - If no unused, unexpired record matches
///   the id and secret; nothing is changed
pub async fn verify_email_tx<S: Store>(
    store: &S,
    params: VerifyEmailTxParams,
) -> Result<VerifyEmailTxResult, LedgerError> {
    let result = execute_in_transaction(store, move |tx| {
        Box::pin(async move {
            let verify_email = tx
                .consume_verify_email(params.email_id, &params.secret_code)
                .await
                .map_err(|error| match error.kind() {
                    ErrorKind::NotFound => LedgerError::InvalidState(INVALID_VERIFICATION.to_string()),
                    _ => error,
                })?;
            let user = tx
                .update_user(&verify_email.username, UserUpdate::verified())
                .await?;
            Ok::<_, LedgerError>(VerifyEmailTxResult { user, verify_email })
        })
    })
    .await?;

    tracing::info!(username = %result.user.username, "email verified");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{NewUser, NewVerifyEmail, VerifyEmailId};
    use chrono::{Duration, Utc};
    use rstest::rstest;

    async fn store_with_code(ttl: Duration) -> (MemoryStore, VerifyEmailId) {
        let store = MemoryStore::new();
        let record = execute_in_transaction(&store, move |tx| {
            Box::pin(async move {
                tx.create_user(NewUser::depositor(
                    "alice",
                    "hash",
                    "Alice",
                    "alice@example.com",
                ))
                .await?;
                tx.create_verify_email(NewVerifyEmail {
                    username: "alice".to_string(),
                    email: "alice@example.com".to_string(),
                    secret_code: "a".repeat(32),
                    expired_at: Utc::now() + ttl,
                })
                .await
            })
        })
        .await
        .unwrap();
        (store, record.id)
    }

    async fn is_verified(store: &MemoryStore) -> bool {
        execute_in_transaction(store, |tx| Box::pin(async move { tx.get_user("alice").await }))
            .await
            .unwrap()
            .is_email_verified
    }

    fn params(email_id: VerifyEmailId, secret_code: &str) -> VerifyEmailTxParams {
        VerifyEmailTxParams {
            email_id,
            secret_code: secret_code.to_string(),
        }
    }

    #[tokio::test]
    async fn test_valid_code_verifies_user() {
        let (store, id) = store_with_code(Duration::minutes(15)).await;

        let result = verify_email_tx(&store, params(id, &"a".repeat(32))).await.unwrap();

        assert!(result.user.is_email_verified);
        assert!(result.verify_email.is_used);
        assert!(is_verified(&store).await);
    }

    #[tokio::test]
    async fn test_second_submission_is_rejected() {
        let (store, id) = store_with_code(Duration::minutes(15)).await;
        verify_email_tx(&store, params(id, &"a".repeat(32))).await.unwrap();

        let error = verify_email_tx(&store, params(id, &"a".repeat(32)))
            .await
            .unwrap_err();

        assert_eq!(error, LedgerError::InvalidState(INVALID_VERIFICATION.to_string()));
    }

    #[rstest]
    #[case::wrong_secret(0, "b", 15)]
    #[case::unknown_id(1, "a", 15)]
    #[case::expired(0, "a", -1)]
    #[tokio::test]
    async fn test_rejections_are_indistinguishable(
        #[case] id_offset: VerifyEmailId,
        #[case] secret_char: &str,
        #[case] ttl_minutes: i64,
    ) {
        let (store, id) = store_with_code(Duration::minutes(ttl_minutes)).await;

        let error = verify_email_tx(&store, params(id + id_offset, &secret_char.repeat(32)))
            .await
            .unwrap_err();

        assert_eq!(error, LedgerError::InvalidState(INVALID_VERIFICATION.to_string()));
        assert!(!is_verified(&store).await);
    }
}
