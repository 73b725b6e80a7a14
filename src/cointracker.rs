//! CoinTracker export normalization.
//!
//! Rewrites a CoinTracker transaction CSV into canonical rows. Each source
//! row becomes zero, one, or two canonical rows:
//!
//! - `TRANSFER` splits into a `SEND` at the sending wallet (carrying the fee)
//!   and a `RECEIVE` at the receiving wallet whose unit price carries the
//!   cost basis across, so transfers stay non-taxable.
//! - Pure fiat legs (`RECEIVE`/`SEND` of USD) are cash movements, not taxable
//!   events, and are dropped without a warning.
//! - Rows with an unrecognized type or date shape are dropped with a warning
//!   naming the offending value.
//!
//! CoinTracker sometimes redacts cost basis cells to a literal `"..."` in
//! exports from accounts past their plan limit. Those cells are treated as
//! absent and reported once for the whole file.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::base::{Diagnostic, TransactionKind};
use crate::native::{self, NativeRow};
use crate::time;

#[derive(Debug)]
pub(crate) struct NormalizeOutcome {
    /// Canonical CSV, ready for [`crate::native::parse_native`].
    pub csv: String,
    pub warnings: Vec<Diagnostic>,
}

/// The cell CoinTracker substitutes for cost basis values it withholds.
const OBFUSCATED: &str = "...";

struct SourceRow<'a> {
    date: &'a str,
    kind: &'a str,
    received_quantity: Option<Decimal>,
    received_currency: Option<&'a str>,
    received_cost_basis: Option<Decimal>,
    received_wallet: Option<&'a str>,
    received_comment: Option<&'a str>,
    sent_quantity: Option<Decimal>,
    sent_currency: Option<&'a str>,
    sent_wallet: Option<&'a str>,
    sent_comment: Option<&'a str>,
    fee_amount: Option<Decimal>,
    fee_currency: Option<&'a str>,
    fee_cost_basis: Option<Decimal>,
    transaction_id: Option<&'a str>,
}

impl SourceRow<'_> {
    /// `Received Cost Basis (USD) / denominator`, blank when either side is
    /// absent or not strictly positive.
    fn unit_price(&self, denominator: Option<Decimal>) -> Option<Decimal> {
        match (self.received_cost_basis, denominator) {
            (Some(basis), Some(quantity)) if basis > Decimal::ZERO && quantity > Decimal::ZERO => {
                Some(basis / quantity)
            }
            _ => None,
        }
    }

    /// Received wallet first for inflows, sent wallet first for outflows.
    fn wallet(&self, kind: TransactionKind) -> &str {
        let (first, second) = match kind {
            TransactionKind::Buy | TransactionKind::Receive | TransactionKind::Staking => {
                (self.received_wallet, self.sent_wallet)
            }
            _ => (self.sent_wallet, self.received_wallet),
        };
        first.or(second).unwrap_or("Unknown")
    }

    fn notes(&self) -> Option<String> {
        match (self.received_comment, self.sent_comment) {
            (Some(received), Some(sent)) => Some(format!("{}; {}", received, sent)),
            (Some(comment), None) | (None, Some(comment)) => Some(comment.to_owned()),
            (None, None) => None,
        }
    }
}

/// Rewrite a CoinTracker export into canonical native CSV.
pub(crate) fn normalize(raw: &str) -> anyhow::Result<NormalizeOutcome> {
    let mut warnings = Vec::new();
    let mut rows: Vec<NativeRow> = Vec::new();
    let mut obfuscated_seen = false;

    if raw.trim().is_empty() {
        return Ok(NormalizeOutcome {
            csv: native::write_rows(&rows)?,
            warnings,
        });
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let headers = reader.headers()?.clone();
    let columns: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(index, name)| (name, index))
        .collect();

    for (index, record) in reader.records().enumerate() {
        let row = index + 2;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warnings.push(Diagnostic::new(row, "", format!("skipped malformed record: {}", err)));
                continue;
            }
        };

        let cell = |name: &str| -> Option<&str> {
            columns
                .get(name)
                .and_then(|&index| record.get(index))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let decimal = |name: &str, obfuscated_seen: &mut bool| -> Option<Decimal> {
            let raw = cell(name)?;
            if raw == OBFUSCATED {
                *obfuscated_seen = true;
                return None;
            }
            raw.parse().ok()
        };

        let source = SourceRow {
            date: cell("Date").unwrap_or_default(),
            kind: cell("Type").unwrap_or_default(),
            received_quantity: decimal("Received Quantity", &mut obfuscated_seen),
            received_currency: cell("Received Currency"),
            received_cost_basis: decimal("Received Cost Basis (USD)", &mut obfuscated_seen),
            received_wallet: cell("Received Wallet"),
            received_comment: cell("Received Comment"),
            sent_quantity: decimal("Sent Quantity", &mut obfuscated_seen),
            sent_currency: cell("Sent Currency"),
            sent_wallet: cell("Sent Wallet"),
            sent_comment: cell("Sent Comment"),
            fee_amount: decimal("Fee Amount", &mut obfuscated_seen),
            fee_currency: cell("Fee Currency"),
            fee_cost_basis: decimal("Fee Cost Basis (USD)", &mut obfuscated_seen),
            transaction_id: cell("Transaction ID"),
        };

        let Some(timestamp) = time::parse_cointracker_date(source.date) else {
            warnings.push(Diagnostic::new(
                row,
                "Date",
                format!("unrecognized date '{}', row dropped", source.date),
            ));
            continue;
        };
        let date_time = time::format_timestamp(timestamp);

        if source.kind == "TRANSFER" {
            rows.extend(split_transfer(&source, &date_time));
            continue;
        }

        let kind = match source.kind {
            "BUY" => TransactionKind::Buy,
            "SELL" => TransactionKind::Sell,
            "TRADE" => TransactionKind::Trade,
            "RECEIVE" => TransactionKind::Receive,
            "SEND" => TransactionKind::Send,
            "STAKING_REWARD" | "INTEREST_PAYMENT" => TransactionKind::Staking,
            other => {
                warnings.push(Diagnostic::new(
                    row,
                    "Type",
                    format!("unrecognized type '{}', row dropped", other),
                ));
                continue;
            }
        };

        // Fiat cash movements are not taxable events.
        if kind == TransactionKind::Receive && source.received_currency == Some("USD") {
            continue;
        }
        if kind == TransactionKind::Send && source.sent_currency == Some("USD") {
            continue;
        }

        let (received_price, sent_price) = match kind {
            TransactionKind::Buy | TransactionKind::Staking | TransactionKind::Receive => {
                (source.unit_price(source.received_quantity), None)
            }
            TransactionKind::Sell => (None, source.unit_price(source.sent_quantity)),
            TransactionKind::Trade => (
                source.unit_price(source.received_quantity),
                source.unit_price(source.sent_quantity),
            ),
            _ => (None, None),
        };

        rows.push(NativeRow {
            date_time: date_time.clone(),
            transaction_type: kind.to_string(),
            sent_asset: source.sent_currency.map(str::to_owned),
            sent_amount: source.sent_quantity.map(render),
            sent_asset_price_usd: sent_price.map(render),
            received_asset: source.received_currency.map(str::to_owned),
            received_amount: source.received_quantity.map(render),
            received_asset_price_usd: received_price.map(render),
            fee_amount: source.fee_amount.map(render),
            fee_asset: source.fee_currency.map(str::to_owned),
            fee_usd: source.fee_cost_basis.map(render),
            wallet_or_exchange: source.wallet(kind).to_owned(),
            tx_hash: source.transaction_id.map(str::to_owned),
            notes: source.notes(),
        });
    }

    if obfuscated_seen {
        warnings.push(Diagnostic::file(
            "cost basis cells obfuscated as '...' were treated as blank; \
             income rows derived from them will lack a fair market value",
        ));
    }

    Ok(NormalizeOutcome {
        csv: native::write_rows(&rows)?,
        warnings,
    })
}

/// A TRANSFER becomes a SEND at the sending wallet plus a RECEIVE at the
/// receiving wallet, sharing timestamp and transaction id. The fee travels on
/// the SEND half; the carried cost basis travels on the RECEIVE half as its
/// unit price.
fn split_transfer(source: &SourceRow<'_>, date_time: &str) -> Vec<NativeRow> {
    let mut rows = Vec::with_capacity(2);
    let notes = source.notes();

    if source.sent_currency.is_some() {
        rows.push(NativeRow {
            date_time: date_time.to_owned(),
            transaction_type: TransactionKind::Send.to_string(),
            sent_asset: source.sent_currency.map(str::to_owned),
            sent_amount: source.sent_quantity.map(render),
            fee_amount: source.fee_amount.map(render),
            fee_asset: source.fee_currency.map(str::to_owned),
            fee_usd: source.fee_cost_basis.map(render),
            wallet_or_exchange: source.sent_wallet.unwrap_or("Unknown").to_owned(),
            tx_hash: source.transaction_id.map(str::to_owned),
            notes: notes.clone(),
            ..Default::default()
        });
    }

    if source.received_currency.is_some() {
        rows.push(NativeRow {
            date_time: date_time.to_owned(),
            transaction_type: TransactionKind::Receive.to_string(),
            received_asset: source.received_currency.map(str::to_owned),
            received_amount: source.received_quantity.map(render),
            received_asset_price_usd: source.unit_price(source.received_quantity).map(render),
            wallet_or_exchange: source.received_wallet.unwrap_or("Unknown").to_owned(),
            tx_hash: source.transaction_id.map(str::to_owned),
            notes,
            ..Default::default()
        });
    }

    rows
}

fn render(value: Decimal) -> String {
    value.normalize().to_string()
}
