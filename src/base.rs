use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Unified transaction kind, shared by the native schema and everything the
/// normalizer emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum TransactionKind {
    /// Purchase of cryptocurrency, which opens a new tax lot at the received
    /// leg's unit price.
    Buy,

    /// Sale of cryptocurrency for fiat, which consumes lots and triggers a
    /// capital gain event.
    Sell,

    /// Crypto-for-crypto exchange. Handled as a disposal of the sent leg
    /// followed by an acquisition of the received leg.
    Trade,

    /// Outgoing transfer to another wallet. Moves inventory without
    /// triggering a capital gain event.
    Send,

    /// Incoming transfer from another wallet. Opens a lot carrying whatever
    /// unit price the sending side attached.
    Receive,

    /// Mining reward, recognized as ordinary income at fair market value.
    Mining,

    /// Staking reward, recognized as ordinary income at fair market value.
    Staking,

    /// Free token airdrop, recognized as ordinary income at fair market value.
    Airdrop,

    /// Coins received from a chain split, recognized as ordinary income at
    /// fair market value.
    Fork,

    /// Disposal of cryptocurrency to pay for goods or services. Taxed like a
    /// sale at the spent value.
    Spend,

    /// Gift given to someone else. Disposed at zero proceeds.
    GiftSent,

    /// Gift received from someone else. Opens a lot like a buy.
    GiftReceived,

    /// Any other payment received in cryptocurrency, recognized as ordinary
    /// income at fair market value.
    Income,
}

impl TransactionKind {
    /// Kinds recognized as ordinary income, which create a lot with basis
    /// equal to the fair market value at receipt.
    pub(crate) fn is_income(self) -> bool {
        matches!(
            self,
            TransactionKind::Mining
                | TransactionKind::Staking
                | TransactionKind::Airdrop
                | TransactionKind::Fork
                | TransactionKind::Income
        )
    }

    /// Kinds that add inventory. On timestamp ties these are replayed before
    /// disposals so a same-instant buy-then-sell can succeed.
    pub(crate) fn adds_inventory(self) -> bool {
        matches!(
            self,
            TransactionKind::Buy | TransactionKind::GiftReceived | TransactionKind::Receive
        ) || self.is_income()
    }

    pub(crate) fn requires_sent_leg(self) -> bool {
        matches!(
            self,
            TransactionKind::Sell
                | TransactionKind::Spend
                | TransactionKind::Send
                | TransactionKind::GiftSent
                | TransactionKind::Trade
        )
    }

    pub(crate) fn requires_received_leg(self) -> bool {
        matches!(
            self,
            TransactionKind::Buy
                | TransactionKind::Receive
                | TransactionKind::GiftReceived
                | TransactionKind::Trade
        ) || self.is_income()
    }
}

/// One validated transaction from the canonical schema.
///
/// Which of the sent/received halves are populated depends on the kind; the
/// parser enforces the required combinations before constructing one of
/// these. `row` is the 1-based source CSV line (header included) and is 0 for
/// transactions built in code.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Transaction {
    pub timestamp: DateTime<Utc>,
    pub kind: TransactionKind,
    pub sent_asset: Option<String>,
    pub sent_amount: Option<Decimal>,
    pub sent_price_usd: Option<Decimal>,
    pub received_asset: Option<String>,
    pub received_amount: Option<Decimal>,
    pub received_price_usd: Option<Decimal>,
    pub fee_amount: Option<Decimal>,
    pub fee_asset: Option<String>,
    pub fee_usd: Option<Decimal>,
    pub wallet: String,
    pub tx_hash: Option<String>,
    pub notes: Option<String>,
    pub row: usize,
}

impl Transaction {
    pub(crate) fn new(timestamp: DateTime<Utc>, kind: TransactionKind, wallet: &str) -> Self {
        Self {
            timestamp,
            kind,
            sent_asset: None,
            sent_amount: None,
            sent_price_usd: None,
            received_asset: None,
            received_amount: None,
            received_price_usd: None,
            fee_amount: None,
            fee_asset: None,
            fee_usd: None,
            wallet: wallet.to_owned(),
            tx_hash: None,
            notes: None,
            row: 0,
        }
    }
}

/// A row-scoped problem attached to parsing, normalization or replay.
///
/// `row` is 1-based and counts the header line; row 0 marks diagnostics that
/// concern the whole file or a transaction without a CSV origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Diagnostic {
    pub row: usize,
    pub field: String,
    pub message: String,
}

impl Diagnostic {
    pub(crate) fn new(row: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            row,
            field: field.to_owned(),
            message: message.into(),
        }
    }

    /// A diagnostic about the input as a whole rather than one row.
    pub(crate) fn file(message: impl Into<String>) -> Self {
        Self::new(0, "", message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.row, self.field.is_empty()) {
            (0, true) => write!(f, "{}", self.message),
            (0, false) => write!(f, "{}: {}", self.field, self.message),
            (row, true) => write!(f, "row {}: {}", row, self.message),
            (row, false) => write!(f, "row {}, {}: {}", row, self.field, self.message),
        }
    }
}
