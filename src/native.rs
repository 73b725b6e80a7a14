//! The canonical 14-column transaction schema.
//!
//! Every foreign format is normalized into this schema before validation, so
//! the strict parser here is the only place raw text becomes a typed
//! [`Transaction`]. Rows never abort the file: a row with errors is dropped
//! and reported, a row with only warnings still contributes a transaction.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::base::{Diagnostic, Transaction, TransactionKind};
use crate::time;

pub(crate) const CANONICAL_HEADERS: [&str; 14] = [
    "date_time",
    "transaction_type",
    "sent_asset",
    "sent_amount",
    "sent_asset_price_usd",
    "received_asset",
    "received_amount",
    "received_asset_price_usd",
    "fee_amount",
    "fee_asset",
    "fee_usd",
    "wallet_or_exchange",
    "tx_hash",
    "notes",
];

/// One canonical row as written to disk. All optionals serialize as empty
/// cells; numbers are decimal strings with a dot radix.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct NativeRow {
    pub date_time: String,
    pub transaction_type: String,
    pub sent_asset: Option<String>,
    pub sent_amount: Option<String>,
    pub sent_asset_price_usd: Option<String>,
    pub received_asset: Option<String>,
    pub received_amount: Option<String>,
    pub received_asset_price_usd: Option<String>,
    pub fee_amount: Option<String>,
    pub fee_asset: Option<String>,
    pub fee_usd: Option<String>,
    pub wallet_or_exchange: String,
    pub tx_hash: Option<String>,
    pub notes: Option<String>,
}

/// Serialize rows to canonical CSV, header line included even when there are
/// no rows. Quoting of embedded commas, quotes and newlines is handled by the
/// writer (RFC 4180).
pub(crate) fn write_rows(rows: &[NativeRow]) -> anyhow::Result<String> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    wtr.write_record(CANONICAL_HEADERS)?;
    for row in rows {
        wtr.serialize(row)?;
    }

    Ok(String::from_utf8(wtr.into_inner()?)?)
}

#[derive(Debug, Default)]
pub(crate) struct ParseOutcome {
    pub transactions: Vec<Transaction>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

/// How a blank-or-decimal field constrains its value.
#[derive(Clone, Copy, PartialEq)]
enum NumberRule {
    /// Zero and negative values are field errors (amounts and unit prices).
    StrictlyPositive,
    /// Negative values are field errors (`fee_usd`, which is proceeds-like).
    NonNegative,
}

/// Strict validation of canonical rows into typed transactions.
///
/// Row numbers in diagnostics are 1-based and include the header row, so the
/// first data row is row 2. Empty or whitespace-only input yields empty
/// results rather than an error.
pub(crate) fn parse_native(raw: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();

    if raw.trim().is_empty() {
        return outcome;
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(err) => {
            outcome
                .errors
                .push(Diagnostic::file(format!("unreadable header row: {}", err)));
            return outcome;
        }
    };

    let columns: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(index, name)| (name, index))
        .collect();

    let mut missing = false;
    for required in ["date_time", "transaction_type", "wallet_or_exchange"] {
        if !columns.contains_key(required) {
            outcome
                .errors
                .push(Diagnostic::new(1, required, "missing required column"));
            missing = true;
        }
    }
    if missing {
        return outcome;
    }

    for (index, record) in reader.records().enumerate() {
        let row = index + 2;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                outcome
                    .errors
                    .push(Diagnostic::new(row, "", format!("malformed CSV record: {}", err)));
                continue;
            }
        };

        let field = |name: &str| -> Option<&str> {
            columns
                .get(name)
                .and_then(|&index| record.get(index))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let mut errors: Vec<Diagnostic> = Vec::new();
        let mut warnings: Vec<Diagnostic> = Vec::new();

        let number = |name: &str, rule: NumberRule, errors: &mut Vec<Diagnostic>| {
            let raw = field(name)?;
            match Decimal::from_str(raw) {
                Ok(value) if rule == NumberRule::StrictlyPositive && value <= Decimal::ZERO => {
                    errors.push(Diagnostic::new(
                        row,
                        name,
                        format!("must be strictly positive, got '{}'", raw),
                    ));
                    None
                }
                Ok(value) if rule == NumberRule::NonNegative && value < Decimal::ZERO => {
                    errors.push(Diagnostic::new(
                        row,
                        name,
                        format!("must not be negative, got '{}'", raw),
                    ));
                    None
                }
                Ok(value) => Some(value),
                Err(_) => {
                    errors.push(Diagnostic::new(row, name, format!("invalid number '{}'", raw)));
                    None
                }
            }
        };

        let timestamp = match field("date_time") {
            Some(raw) => match time::parse_timestamp(raw) {
                Ok(parsed) => {
                    if !parsed.zoned {
                        warnings.push(Diagnostic::new(
                            row,
                            "date_time",
                            format!("'{}' has no timezone, assuming UTC", raw),
                        ));
                    }
                    Some(parsed.instant)
                }
                Err(message) => {
                    errors.push(Diagnostic::new(row, "date_time", message));
                    None
                }
            },
            None => {
                errors.push(Diagnostic::new(row, "date_time", "missing required field"));
                None
            }
        };

        let kind = match field("transaction_type") {
            Some(raw) => match TransactionKind::from_str(raw) {
                Ok(kind) => Some(kind),
                Err(_) => {
                    errors.push(Diagnostic::new(
                        row,
                        "transaction_type",
                        format!("unknown transaction type '{}'", raw),
                    ));
                    None
                }
            },
            None => {
                errors.push(Diagnostic::new(row, "transaction_type", "missing required field"));
                None
            }
        };

        let wallet = field("wallet_or_exchange");
        if wallet.is_none() {
            errors.push(Diagnostic::new(row, "wallet_or_exchange", "missing required field"));
        }

        let sent_asset = field("sent_asset").map(str::to_owned);
        let sent_amount = number("sent_amount", NumberRule::StrictlyPositive, &mut errors);
        let sent_price_usd = number("sent_asset_price_usd", NumberRule::StrictlyPositive, &mut errors);
        let received_asset = field("received_asset").map(str::to_owned);
        let received_amount = number("received_amount", NumberRule::StrictlyPositive, &mut errors);
        let received_price_usd =
            number("received_asset_price_usd", NumberRule::StrictlyPositive, &mut errors);
        let fee_amount = number("fee_amount", NumberRule::StrictlyPositive, &mut errors);
        let fee_asset = field("fee_asset").map(str::to_owned);
        let fee_usd = number("fee_usd", NumberRule::NonNegative, &mut errors);

        if let Some(kind) = kind {
            // Presence is judged on the raw cell so an invalid value is not
            // additionally reported as missing.
            let mut require = |name: &str| {
                if field(name).is_none() {
                    errors.push(Diagnostic::new(
                        row,
                        name,
                        format!("required for {} transactions", kind),
                    ));
                }
            };

            if kind.requires_sent_leg() {
                require("sent_asset");
                require("sent_amount");
            }
            if kind.requires_received_leg() {
                require("received_asset");
                require("received_amount");
            }
            if kind.is_income() {
                require("received_asset_price_usd");
            }
        }

        if errors.is_empty() {
            // checked above, errors otherwise
            let (timestamp, kind, wallet) = (timestamp.unwrap(), kind.unwrap(), wallet.unwrap());
            outcome.transactions.push(Transaction {
                timestamp,
                kind,
                sent_asset,
                sent_amount,
                sent_price_usd,
                received_asset,
                received_amount,
                received_price_usd,
                fee_amount,
                fee_asset,
                fee_usd,
                wallet: wallet.to_owned(),
                tx_hash: field("tx_hash").map(str::to_owned),
                notes: field("notes").map(str::to_owned),
                row,
            });
            outcome.warnings.append(&mut warnings);
        } else {
            outcome.errors.append(&mut errors);
            outcome.warnings.append(&mut warnings);
        }
    }

    outcome
}
