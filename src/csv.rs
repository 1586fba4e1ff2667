use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::amount::AmountError;
use crate::{Account, AccountId, Amount, TransferRequest};

/// Errors that can occur when reading csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: invalid amount: {source}")]
    Amount { line: usize, source: AmountError },
}

/// Opening balance of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRow {
    pub id: AccountId,
    pub owner_name: String,
    pub balance: Amount,
}

#[derive(Debug, Deserialize)]
struct AccountInput {
    account_id: String,
    owner_name: String,
    balance: String,
}

#[derive(Debug, Deserialize)]
struct TransferInput {
    key: String,
    from: String,
    to: String,
    amount: String,
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct AccountOutput<'a> {
    account_id: &'a str,
    owner_name: &'a str,
    balance: String,
    revision: u64,
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })
}

fn parse_amount(line: usize, raw: &str) -> Result<Amount, CsvError> {
    raw.parse()
        .map_err(|source| CsvError::Amount { line, source })
}

/// Read opening balances (`account_id,owner_name,balance`) from a csv file
pub fn read_accounts(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<AccountRow, CsvError>>, CsvError> {
    let reader = open(path.as_ref())?;

    Ok(reader
        .into_deserialize::<AccountInput>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            Ok(AccountRow {
                id: row.account_id.into(),
                owner_name: row.owner_name,
                balance: parse_amount(line, &row.balance)?,
            })
        }))
}

/// Read transfer requests (`key,from,to,amount,description`) from a csv file
///
/// An empty description is read as none.
pub fn read_transfers(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<TransferRequest, CsvError>>, CsvError> {
    let reader = open(path.as_ref())?;

    Ok(reader
        .into_deserialize::<TransferInput>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2;
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let amount = parse_amount(line, &row.amount)?;
            let request = TransferRequest::new(row.key, row.from, row.to, amount);
            Ok(match row.description.filter(|d| !d.is_empty()) {
                Some(description) => request.with_description(description),
                None => request,
            })
        }))
}

/// Write accounts in csv format
pub fn write_accounts<'a>(
    accounts: impl IntoIterator<Item = &'a Account>,
    out: impl io::Write,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);

    for account in accounts {
        writer.serialize(AccountOutput {
            account_id: account.id.as_str(),
            owner_name: &account.owner_name,
            balance: account.balance.to_string(),
            revision: account.revision,
        })?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn read_account_rows() {
        let file = write_csv("account_id,owner_name,balance\nA,Alice,1000.00\nB,Bob,0\n");
        let rows: Vec<_> = read_accounts(file.path())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            rows,
            vec![
                AccountRow {
                    id: "A".into(),
                    owner_name: "Alice".into(),
                    balance: Amount::from_units(1000),
                },
                AccountRow {
                    id: "B".into(),
                    owner_name: "Bob".into(),
                    balance: Amount::ZERO,
                },
            ]
        );
    }

    #[test]
    fn read_transfer_rows() {
        let file = write_csv("key,from,to,amount,description\nt1,A,B,250.00,rent\nt2,B,A,0.5,\n");
        let rows: Vec<_> = read_transfers(file.path())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            rows[0],
            TransferRequest::new("t1", "A", "B", Amount::from_units(250)).with_description("rent")
        );
        assert_eq!(rows[1], TransferRequest::new("t2", "B", "A", Amount::from_minor(50)));
    }

    #[test]
    fn read_with_whitespace() {
        let file = write_csv("key, from, to, amount, description\nt1, A, B, 1.00, \n");
        let results: Vec<_> = read_transfers(file.path()).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn read_returns_error_for_bad_amount() {
        let file = write_csv("key,from,to,amount,description\nt1,A,B,abc,\nt2,A,B,1.005,\n");
        let results: Vec<_> = read_transfers(file.path()).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(CsvError::Amount { line: 2, .. })));
        assert!(matches!(
            results[1],
            Err(CsvError::Amount {
                line: 3,
                source: AmountError::TooManyDecimals { .. }
            })
        ));
    }

    #[test]
    fn read_returns_error_for_short_row() {
        let file = write_csv("account_id,owner_name,balance\nA,Alice\n");
        let results: Vec<_> = read_accounts(file.path()).unwrap().collect();
        assert!(matches!(results[0], Err(CsvError::Parse { line: 2, .. })));
    }

    #[test]
    fn missing_file_is_reported() {
        let result = read_transfers("does/not/exist.csv");
        assert!(matches!(result, Err(CsvError::Open { .. })));
    }

    #[test]
    fn write_account_rows() {
        let account = Account {
            id: "A".into(),
            owner_name: "Alice".into(),
            balance: Amount::from_minor(75050),
            revision: 2,
            created_at: Utc::now(),
        };
        let mut out = Vec::new();
        write_accounts([&account], &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "account_id,owner_name,balance,revision\nA,Alice,750.50,2\n"
        );
    }
}
