//! CSV format handling for replay input and balance output
//!
//! This module centralizes all CSV format concerns, providing:
//! - Row structures for the account seed file, the transfer file and the
//!   user registration file
//! - Conversion from decimal amounts to integer minor units
//! - Balance output serialization
//!
//! All functions are pure (no I/O) for easy testing.
//!
//! # Formats
//!
//! Accounts: `account,owner,currency,balance`, e.g. `1,alice,USD,1000.00`
//!
//! Transfers: `from,to,amount`, e.g. `1,2,300.00`
//!
//! Users: `username,full_name,email`, e.g. `alice,Alice Liddell,alice@example.com`
//!
//! Amounts carry at most two decimal places.

use crate::types::{AccountBalance, AccountId, AccountRecord, NewUser, TransferRecord};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io::Write;
use std::str::FromStr;

/// Number of decimal places in a minor unit
const MINOR_UNIT_SCALE: u32 = 2;

/// A CSV row that converts into a replay record
///
/// Implemented by each file format so the readers can stay generic.
pub trait CsvRow: DeserializeOwned {
    /// Domain record produced by a valid row
    type Record;

    /// Validate the row and convert it into its domain record
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    fn convert(self) -> Result<Self::Record, String>;
}

/// Row of the account seed file
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AccountCsvRecord {
    pub account: AccountId,
    pub owner: String,
    pub currency: String,
    pub balance: String,
}

/// Row of the transfer file
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TransferCsvRecord {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: String,
}

/// Row of the user registration file
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct UserCsvRecord {
    pub username: String,
    pub full_name: String,
    pub email: String,
}

impl CsvRow for AccountCsvRecord {
    type Record = AccountRecord;

    fn convert(self) -> Result<AccountRecord, String> {
        if self.owner.is_empty() {
            return Err(format!("Account {} has no owner", self.account));
        }
        let currency = self.currency.to_ascii_uppercase();
        if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(format!(
                "Invalid currency '{}' for account {}",
                self.currency, self.account
            ));
        }
        let balance = parse_minor_units(&self.balance)
            .map_err(|e| format!("{} for account {}", e, self.account))?;

        Ok(AccountRecord {
            account: self.account,
            owner: self.owner,
            currency,
            balance,
        })
    }
}

impl CsvRow for UserCsvRecord {
    type Record = NewUser;

    /// Users registered from a file have no password; they are depositors
    fn convert(self) -> Result<NewUser, String> {
        let valid_username = !self.username.is_empty()
            && self
                .username
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_');
        if !valid_username {
            return Err(format!("Invalid username '{}'", self.username));
        }
        if self.full_name.is_empty() {
            return Err(format!("User {} has no full name", self.username));
        }
        match self.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
            _ => {
                return Err(format!(
                    "Invalid email '{}' for user {}",
                    self.email, self.username
                ))
            }
        }

        Ok(NewUser::depositor(self.username, "", self.full_name, self.email))
    }
}

impl CsvRow for TransferCsvRecord {
    type Record = TransferRecord;

    fn convert(self) -> Result<TransferRecord, String> {
        let amount = parse_minor_units(&self.amount)
            .map_err(|e| format!("{} for transfer {} -> {}", e, self.from, self.to))?;

        Ok(TransferRecord {
            from: self.from,
            to: self.to,
            amount,
        })
    }
}

/// Parse a decimal amount such as `"12.34"` into minor units (`1234`)
///
/// Sign is preserved; the transfer engine decides what a non-positive
/// amount means.
///
/// # Errors
///
/// Returns an error if the text is not a decimal number, carries more than
/// two significant decimal places, or does not fit in an `i64`.
pub fn parse_minor_units(amount: &str) -> Result<i64, String> {
    let decimal = Decimal::from_str(amount.trim())
        .map_err(|_| format!("Invalid amount '{}'", amount))?
        .normalize();

    if decimal.scale() > MINOR_UNIT_SCALE {
        return Err(format!(
            "Amount '{}' has more than {} decimal places",
            amount, MINOR_UNIT_SCALE
        ));
    }

    decimal
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|minor| minor.to_i64())
        .ok_or_else(|| format!("Amount '{}' is out of range", amount))
}

/// Render minor units as a decimal string with two places
pub fn format_minor_units(minor: i64) -> String {
    format!("{:.2}", Decimal::new(minor, MINOR_UNIT_SCALE))
}

/// Write final balances to CSV format
///
/// Writes rows with columns: account, owner, currency, balance.
/// Rows are sorted by account number for deterministic output.
///
/// # Arguments
///
/// * `balances` - Slice of final account balances to write
/// * `output` - Mutable reference to a writer for outputting CSV
///
/// # Returns
///
/// * `Ok(())` if writing succeeded
/// * `Err(String)` if a write error occurred
pub fn write_accounts_csv(
    balances: &[AccountBalance],
    output: &mut dyn Write,
) -> Result<(), String> {
    let mut writer = csv::Writer::from_writer(output);

    writer
        .write_record(["account", "owner", "currency", "balance"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    let mut sorted: Vec<&AccountBalance> = balances.iter().collect();
    sorted.sort_by_key(|balance| balance.account);

    for balance in sorted {
        writer
            .write_record([
                balance.account.to_string(),
                balance.owner.clone(),
                balance.currency.clone(),
                format_minor_units(balance.balance),
            ])
            .map_err(|e| format!("Failed to write account record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::whole("100", 10000)]
    #[case::one_place("12.5", 1250)]
    #[case::two_places("0.01", 1)]
    #[case::trailing_zeros("7.500", 750)]
    #[case::negative("-3.25", -325)]
    #[case::padded("  42.00 ", 4200)]
    fn test_parse_minor_units(#[case] input: &str, #[case] expected: i64) {
        assert_eq!(parse_minor_units(input), Ok(expected));
    }

    #[rstest]
    #[case::not_a_number("abc", "Invalid amount")]
    #[case::empty("", "Invalid amount")]
    #[case::too_precise("1.005", "more than 2 decimal places")]
    #[case::overflow("99999999999999999999", "out of range")]
    fn test_parse_minor_units_rejects(#[case] input: &str, #[case] message: &str) {
        let error = parse_minor_units(input).unwrap_err();
        assert!(error.contains(message), "unexpected error: {}", error);
    }

    #[rstest]
    #[case::positive(123456, "1234.56")]
    #[case::zero(0, "0.00")]
    #[case::cents(5, "0.05")]
    #[case::negative(-250, "-2.50")]
    fn test_format_minor_units(#[case] minor: i64, #[case] expected: &str) {
        assert_eq!(format_minor_units(minor), expected);
    }

    #[test]
    fn test_user_row_becomes_depositor() {
        let user = UserCsvRecord {
            username: "alice_1".to_string(),
            full_name: "Alice Liddell".to_string(),
            email: "alice@example.com".to_string(),
        }
        .convert()
        .unwrap();

        assert_eq!(
            user,
            NewUser::depositor("alice_1", "", "Alice Liddell", "alice@example.com")
        );
    }

    #[rstest]
    #[case::empty_username("", "Alice", "alice@example.com", "Invalid username")]
    #[case::spaced_username("al ice", "Alice", "alice@example.com", "Invalid username")]
    #[case::no_full_name("alice", "", "alice@example.com", "no full name")]
    #[case::no_at("alice", "Alice", "alice.example.com", "Invalid email")]
    #[case::no_domain_dot("alice", "Alice", "alice@localhost", "Invalid email")]
    #[case::no_local_part("alice", "Alice", "@example.com", "Invalid email")]
    fn test_user_row_rejects(
        #[case] username: &str,
        #[case] full_name: &str,
        #[case] email: &str,
        #[case] message: &str,
    ) {
        let error = UserCsvRecord {
            username: username.to_string(),
            full_name: full_name.to_string(),
            email: email.to_string(),
        }
        .convert()
        .unwrap_err();
        assert!(error.contains(message), "unexpected error: {}", error);
    }

    #[test]
    fn test_account_row_normalizes_currency() {
        let record = AccountCsvRecord {
            account: 7,
            owner: "alice".to_string(),
            currency: "usd".to_string(),
            balance: "10.00".to_string(),
        }
        .convert()
        .unwrap();

        assert_eq!(
            record,
            AccountRecord {
                account: 7,
                owner: "alice".to_string(),
                currency: "USD".to_string(),
                balance: 1000,
            }
        );
    }

    #[rstest]
    #[case::empty_owner("", "USD", "1.00", "has no owner")]
    #[case::short_currency("alice", "US", "1.00", "Invalid currency")]
    #[case::numeric_currency("alice", "U5D", "1.00", "Invalid currency")]
    #[case::bad_balance("alice", "USD", "lots", "Invalid amount 'lots' for account 3")]
    fn test_account_row_rejects(
        #[case] owner: &str,
        #[case] currency: &str,
        #[case] balance: &str,
        #[case] message: &str,
    ) {
        let error = AccountCsvRecord {
            account: 3,
            owner: owner.to_string(),
            currency: currency.to_string(),
            balance: balance.to_string(),
        }
        .convert()
        .unwrap_err();

        assert!(error.contains(message), "unexpected error: {}", error);
    }

    #[test]
    fn test_transfer_row_error_names_accounts() {
        let error = TransferCsvRecord {
            from: 1,
            to: 2,
            amount: "1.234".to_string(),
        }
        .convert()
        .unwrap_err();

        assert!(error.ends_with("for transfer 1 -> 2"));
    }

    #[test]
    fn test_write_accounts_csv_sorts_by_account() {
        let balances = vec![
            AccountBalance {
                account: 9,
                owner: "bob".to_string(),
                currency: "EUR".to_string(),
                balance: 20000,
            },
            AccountBalance {
                account: 2,
                owner: "alice".to_string(),
                currency: "USD".to_string(),
                balance: -150,
            },
        ];
        let mut output = Vec::new();

        write_accounts_csv(&balances, &mut output).unwrap();

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "account,owner,currency,balance\n2,alice,USD,-1.50\n9,bob,EUR,200.00\n"
        );
    }

    #[test]
    fn test_write_accounts_csv_empty_writes_header() {
        let mut output = Vec::new();
        write_accounts_csv(&[], &mut output).unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "account,owner,currency,balance\n"
        );
    }
}
