//! Replay of the transaction log against the lot pool.
//!
//! Transactions are applied in effective time order: stable by timestamp,
//! with inventory-adding kinds ahead of disposals on ties so a same-instant
//! buy-then-sell succeeds. A failing transaction is recorded as an error
//! annotated with its kind and timestamp and never aborts the replay.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::base::{Diagnostic, Transaction, TransactionKind};
use crate::lots::{LotError, LotPool, SelectionMethod};
use crate::time;

/// Realized gain or loss for one consumed lot. A disposal of N lots emits N
/// of these, with proceeds split proportionally across them.
#[derive(Debug, Clone)]
pub(crate) struct Disposal {
    pub asset: String,
    pub amount: Decimal,
    pub disposed: DateTime<Utc>,
    pub kind: TransactionKind,
    pub proceeds: Decimal,
    pub cost_basis: Decimal,
    pub gain: Decimal,
    pub long_term: bool,
    pub days_held: i64,
    pub acquired: DateTime<Utc>,
    pub lot_id: u64,
}

/// Ordinary income recognized at fair market value. The FMV is both the
/// income amount and the basis of the lot the event opens.
#[derive(Debug, Clone)]
pub(crate) struct IncomeEvent {
    pub date: DateTime<Utc>,
    pub kind: TransactionKind,
    pub asset: String,
    pub amount: Decimal,
    pub fmv_usd: Decimal,
    pub wallet: String,
}

#[derive(Debug, Default)]
pub(crate) struct CalcResult {
    pub disposals: Vec<Disposal>,
    pub income_events: Vec<IncomeEvent>,
    pub remaining_lots: Vec<crate::lots::Lot>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

/// Recognize ordinary-income transactions (mining, staking, airdrops, forks,
/// other income). Returns nothing when the received leg is incomplete.
pub(crate) fn classify_income(tx: &Transaction) -> Option<IncomeEvent> {
    if !tx.kind.is_income() {
        return None;
    }
    let asset = tx.received_asset.as_deref()?;
    let amount = tx.received_amount?;
    let unit_price = tx.received_price_usd?;

    Some(IncomeEvent {
        date: tx.timestamp,
        kind: tx.kind,
        asset: asset.to_owned(),
        amount,
        fmv_usd: amount * unit_price,
        wallet: tx.wallet.clone(),
    })
}

/// Consume lots and emit one [`Disposal`] per consumed slice.
///
/// Proceeds are split in proportion to the consumed amounts; the final slice
/// takes the unallocated remainder so the slices always sum to
/// `total_proceeds` exactly.
pub(crate) fn dispose(
    pool: &mut LotPool,
    wallet: &str,
    asset: &str,
    amount: Decimal,
    total_proceeds: Decimal,
    disposed: DateTime<Utc>,
    kind: TransactionKind,
    method: SelectionMethod,
) -> Result<Vec<Disposal>, LotError> {
    let consumed = pool.consume(wallet, asset, amount, method)?;
    let total: Decimal = consumed.iter().map(|slice| slice.amount).sum();

    let mut disposals = Vec::with_capacity(consumed.len());
    let mut allocated = Decimal::ZERO;
    for (index, slice) in consumed.iter().enumerate() {
        let proceeds = if index == consumed.len() - 1 {
            total_proceeds - allocated
        } else {
            total_proceeds * slice.amount / total
        };
        allocated += proceeds;

        let cost_basis = slice.amount * slice.basis_per_unit;
        let days_held = (disposed - slice.acquired).num_days();
        disposals.push(Disposal {
            asset: slice.asset.clone(),
            amount: slice.amount,
            disposed,
            kind,
            proceeds,
            cost_basis,
            gain: proceeds - cost_basis,
            long_term: days_held > 365,
            days_held,
            acquired: slice.acquired,
            lot_id: slice.lot_id,
        });
    }

    Ok(disposals)
}

/// Replay `transactions` under `method`, producing realized events and the
/// residual inventory.
pub(crate) fn calculate(transactions: &[Transaction], method: SelectionMethod) -> CalcResult {
    let mut ordered: Vec<&Transaction> = transactions.iter().collect();
    ordered.sort_by_key(|tx| (tx.timestamp, !tx.kind.adds_inventory()));

    let mut pool = LotPool::new();
    let mut result = CalcResult::default();

    for tx in ordered {
        if let Err(message) = apply(&mut pool, tx, method, &mut result) {
            warn!(kind = %tx.kind, timestamp = %tx.timestamp, row = tx.row, "transaction failed: {message}");
            result.errors.push(Diagnostic::new(
                tx.row,
                "",
                format!(
                    "{} at {}: {}",
                    tx.kind,
                    time::format_timestamp(tx.timestamp),
                    message
                ),
            ));
        }
    }

    result.remaining_lots = pool.remaining_lots();
    result
}

fn received_leg(tx: &Transaction) -> Result<(&str, Decimal), String> {
    match (tx.received_asset.as_deref(), tx.received_amount) {
        (Some(asset), Some(amount)) => Ok((asset, amount)),
        _ => Err("received asset and amount required".to_owned()),
    }
}

fn sent_leg(tx: &Transaction) -> Result<(&str, Decimal), String> {
    match (tx.sent_asset.as_deref(), tx.sent_amount) {
        (Some(asset), Some(amount)) => Ok((asset, amount)),
        _ => Err("sent asset and amount required".to_owned()),
    }
}

fn apply(
    pool: &mut LotPool,
    tx: &Transaction,
    method: SelectionMethod,
    result: &mut CalcResult,
) -> Result<(), String> {
    match tx.kind {
        TransactionKind::Buy | TransactionKind::GiftReceived | TransactionKind::Receive => {
            let (asset, amount) = received_leg(tx)?;
            // A missing price opens the lot at zero basis rather than failing;
            // transfers without carried basis land here.
            let basis = tx.received_price_usd.unwrap_or(Decimal::ZERO);
            pool.add(&tx.wallet, asset, amount, basis, tx.timestamp, tx.kind);
            Ok(())
        }

        TransactionKind::Mining
        | TransactionKind::Staking
        | TransactionKind::Airdrop
        | TransactionKind::Fork
        | TransactionKind::Income => match classify_income(tx) {
            Some(event) => {
                pool.add(
                    &tx.wallet,
                    &event.asset,
                    event.amount,
                    tx.received_price_usd.unwrap_or(Decimal::ZERO),
                    tx.timestamp,
                    tx.kind,
                );
                result.income_events.push(event);
                Ok(())
            }
            None => Err("received asset, amount and unit price required".to_owned()),
        },

        TransactionKind::Sell | TransactionKind::Spend => {
            let (asset, amount) = sent_leg(tx)?;
            let unit_price = tx
                .sent_price_usd
                .ok_or("sent asset price required to compute proceeds")?;
            let disposals = dispose(
                pool,
                &tx.wallet,
                asset,
                amount,
                amount * unit_price,
                tx.timestamp,
                tx.kind,
                method,
            )
            .map_err(|err| err.to_string())?;
            result.disposals.extend(disposals);
            Ok(())
        }

        TransactionKind::Trade => {
            let (sent_asset, sent_amount) = sent_leg(tx)?;
            let (received_asset, received_amount) = received_leg(tx)?;
            let unit_price = tx
                .sent_price_usd
                .ok_or("sent asset price required to compute proceeds")?;

            let disposals = dispose(
                pool,
                &tx.wallet,
                sent_asset,
                sent_amount,
                sent_amount * unit_price,
                tx.timestamp,
                tx.kind,
                method,
            )
            .map_err(|err| err.to_string())?;
            result.disposals.extend(disposals);

            pool.add(
                &tx.wallet,
                received_asset,
                received_amount,
                tx.received_price_usd.unwrap_or(Decimal::ZERO),
                tx.timestamp,
                tx.kind,
            );
            Ok(())
        }

        TransactionKind::Send => {
            let (asset, amount) = sent_leg(tx)?;
            pool.consume(&tx.wallet, asset, amount, SelectionMethod::Fifo)
                .map_err(|err| err.to_string())?;
            apply_send_fee(pool, tx, asset, method, result);
            Ok(())
        }

        TransactionKind::GiftSent => {
            // Disposed at zero proceeds, recovering the full basis as a loss.
            let (asset, amount) = sent_leg(tx)?;
            let disposals = dispose(
                pool,
                &tx.wallet,
                asset,
                amount,
                Decimal::ZERO,
                tx.timestamp,
                tx.kind,
                method,
            )
            .map_err(|err| err.to_string())?;
            result.disposals.extend(disposals);
            Ok(())
        }
    }
}

/// A network fee on an outgoing transfer is itself a disposal when paid in
/// the transferred asset. A shortfall only skips the fee, and a fee paid in
/// some other asset is left alone; both cases warn instead of failing the
/// transfer.
fn apply_send_fee(
    pool: &mut LotPool,
    tx: &Transaction,
    sent_asset: &str,
    method: SelectionMethod,
    result: &mut CalcResult,
) {
    let (Some(fee_asset), Some(fee_amount)) = (tx.fee_asset.as_deref(), tx.fee_amount) else {
        return;
    };

    if fee_asset != sent_asset {
        result.warnings.push(Diagnostic::new(
            tx.row,
            "fee_asset",
            format!(
                "fee asset {} differs from sent asset {}; fee not disposed",
                fee_asset, sent_asset
            ),
        ));
        return;
    }

    let proceeds = tx.fee_usd.unwrap_or(Decimal::ZERO);
    match dispose(
        pool,
        &tx.wallet,
        fee_asset,
        fee_amount,
        proceeds,
        tx.timestamp,
        TransactionKind::Spend,
        method,
    ) {
        Ok(disposals) => result.disposals.extend(disposals),
        Err(err) => result.warnings.push(Diagnostic::new(
            tx.row,
            "fee_amount",
            format!("transfer fee skipped: {}", err),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    fn buy(when: DateTime<Utc>, asset: &str, amount: Decimal, price: Decimal, wallet: &str) -> Transaction {
        let mut tx = Transaction::new(when, TransactionKind::Buy, wallet);
        tx.received_asset = Some(asset.to_owned());
        tx.received_amount = Some(amount);
        tx.received_price_usd = Some(price);
        tx
    }

    fn sell(when: DateTime<Utc>, asset: &str, amount: Decimal, price: Decimal, wallet: &str) -> Transaction {
        let mut tx = Transaction::new(when, TransactionKind::Sell, wallet);
        tx.sent_asset = Some(asset.to_owned());
        tx.sent_amount = Some(amount);
        tx.sent_price_usd = Some(price);
        tx
    }

    #[test]
    fn fifo_and_hifo_diverge_on_mixed_basis() {
        let transactions = vec![
            buy(at(2024, 1, 1), "BTC", dec!(1), dec!(30000), "Coinbase"),
            buy(at(2024, 2, 1), "BTC", dec!(1), dec!(40000), "Coinbase"),
            sell(at(2024, 6, 1), "BTC", dec!(1), dec!(50000), "Coinbase"),
        ];

        let fifo = calculate(&transactions, SelectionMethod::Fifo);
        assert!(fifo.errors.is_empty());
        assert_eq!(fifo.disposals.len(), 1);
        assert_eq!(fifo.disposals[0].gain, dec!(20000));

        let hifo = calculate(&transactions, SelectionMethod::Hifo);
        assert_eq!(hifo.disposals[0].gain, dec!(10000));

        // HIFO's realized gain never exceeds FIFO's or LIFO's.
        let lifo = calculate(&transactions, SelectionMethod::Lifo);
        assert!(hifo.disposals[0].gain <= fifo.disposals[0].gain);
        assert!(hifo.disposals[0].gain <= lifo.disposals[0].gain);
    }

    #[test]
    fn long_term_is_strictly_more_than_365_days() {
        let transactions = vec![
            buy(at(2023, 1, 1), "BTC", dec!(1), dec!(20000), "Coinbase"),
            buy(at(2024, 3, 1), "ETH", dec!(10), dec!(2000), "Coinbase"),
            sell(at(2024, 6, 1), "BTC", dec!(1), dec!(60000), "Coinbase"),
            sell(at(2024, 6, 1), "ETH", dec!(10), dec!(2500), "Coinbase"),
        ];

        let result = calculate(&transactions, SelectionMethod::Fifo);
        assert!(result.errors.is_empty());
        assert_eq!(result.disposals.len(), 2);

        let btc = result.disposals.iter().find(|d| d.asset == "BTC").unwrap();
        assert!(btc.long_term);
        assert_eq!(btc.gain, dec!(40000));
        assert_eq!(btc.days_held, 517);

        let eth = result.disposals.iter().find(|d| d.asset == "ETH").unwrap();
        assert!(!eth.long_term);
        assert_eq!(eth.gain, dec!(5000));
        assert_eq!(eth.days_held, 92);
    }

    #[test]
    fn exactly_365_days_is_short_term() {
        let transactions = vec![
            buy(at(2023, 6, 1), "BTC", dec!(1), dec!(20000), "Coinbase"),
            sell(at(2024, 5, 31), "BTC", dec!(1), dec!(60000), "Coinbase"),
        ];

        let result = calculate(&transactions, SelectionMethod::Fifo);
        assert_eq!(result.disposals[0].days_held, 365);
        assert!(!result.disposals[0].long_term);
    }

    #[test]
    fn same_instant_buy_is_applied_before_sell() {
        let when = at(2024, 6, 1);
        // SELL listed first; the tie-break must still apply the BUY first.
        let transactions = vec![
            sell(when, "BTC", dec!(1), dec!(50000), "Coinbase"),
            buy(when, "BTC", dec!(1), dec!(45000), "Coinbase"),
        ];

        let result = calculate(&transactions, SelectionMethod::Fifo);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(result.disposals.len(), 1);
        assert_eq!(result.disposals[0].gain, dec!(5000));
        assert!(result.remaining_lots.is_empty());
    }

    #[test]
    fn insufficient_lots_is_recorded_and_replay_continues() {
        let transactions = vec![
            sell(at(2024, 1, 1), "BTC", dec!(1), dec!(50000), "Coinbase"),
            buy(at(2024, 2, 1), "BTC", dec!(1), dec!(30000), "Coinbase"),
        ];

        let result = calculate(&transactions, SelectionMethod::Fifo);
        assert!(result.disposals.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("Insufficient lots"));
        assert!(result.errors[0].message.contains("SELL"));
        // The later buy still went through.
        assert_eq!(result.remaining_lots.len(), 1);
    }

    #[test]
    fn gift_sent_disposes_at_zero_proceeds() {
        let transactions = vec![buy(at(2024, 1, 1), "BTC", dec!(1), dec!(30000), "Coinbase"), {
            let mut tx = Transaction::new(at(2024, 3, 1), TransactionKind::GiftSent, "Coinbase");
            tx.sent_asset = Some("BTC".to_owned());
            tx.sent_amount = Some(dec!(0.5));
            tx
        }];

        let result = calculate(&transactions, SelectionMethod::Fifo);
        assert!(result.errors.is_empty());
        assert_eq!(result.disposals.len(), 1);
        let disposal = &result.disposals[0];
        assert_eq!(disposal.proceeds, Decimal::ZERO);
        assert_eq!(disposal.cost_basis, dec!(15000));
        assert_eq!(disposal.gain, dec!(-15000));
        assert_eq!(disposal.kind, TransactionKind::GiftSent);
    }

    #[test]
    fn proceeds_split_proportionally_and_sum_exactly() {
        let transactions = vec![
            buy(at(2024, 1, 1), "ETH", dec!(1), dec!(2000), "Kraken"),
            buy(at(2024, 1, 2), "ETH", dec!(1), dec!(2100), "Kraken"),
            buy(at(2024, 1, 3), "ETH", dec!(1), dec!(2200), "Kraken"),
            sell(at(2024, 2, 1), "ETH", dec!(3), dec!(2500), "Kraken"),
        ];

        let result = calculate(&transactions, SelectionMethod::Fifo);
        assert_eq!(result.disposals.len(), 3);

        let proceeds: Decimal = result.disposals.iter().map(|d| d.proceeds).sum();
        let amounts: Decimal = result.disposals.iter().map(|d| d.amount).sum();
        assert_eq!(proceeds, dec!(7500));
        assert_eq!(amounts, dec!(3));
    }

    #[test]
    fn awkward_ratio_still_sums_exactly() {
        // A third of 100 is not representable; the remainder lands on the last
        // slice so the total is preserved to the cent and beyond.
        let mut pool = LotPool::new();
        pool.add("Kraken", "ETH", dec!(1), dec!(2000), at(2024, 1, 1), TransactionKind::Buy);
        pool.add("Kraken", "ETH", dec!(2), dec!(2100), at(2024, 1, 2), TransactionKind::Buy);

        let disposals = dispose(
            &mut pool,
            "Kraken",
            "ETH",
            dec!(3),
            dec!(100),
            at(2024, 2, 1),
            TransactionKind::Sell,
            SelectionMethod::Fifo,
        )
        .unwrap();

        assert_eq!(disposals.len(), 2);
        assert_ne!(disposals[0].proceeds * dec!(3), dec!(100));
        let proceeds: Decimal = disposals.iter().map(|d| d.proceeds).sum();
        assert_eq!(proceeds, dec!(100));
    }

    #[test]
    fn income_recognized_at_fmv_and_lot_basis_matches() {
        let mut staking = Transaction::new(at(2024, 4, 1), TransactionKind::Staking, "Kraken");
        staking.received_asset = Some("ETH".to_owned());
        staking.received_amount = Some(dec!(2));
        staking.received_price_usd = Some(dec!(3000));

        let result = calculate(&[staking], SelectionMethod::Fifo);
        assert_eq!(result.income_events.len(), 1);
        let event = &result.income_events[0];
        assert_eq!(event.fmv_usd, dec!(6000));
        assert_eq!(event.kind, TransactionKind::Staking);

        assert_eq!(result.remaining_lots.len(), 1);
        assert_eq!(result.remaining_lots[0].basis_per_unit, dec!(3000));
        assert_eq!(result.remaining_lots[0].acquired_as, TransactionKind::Staking);
    }

    #[test]
    fn income_without_price_is_an_error() {
        let mut mining = Transaction::new(at(2024, 4, 1), TransactionKind::Mining, "rig");
        mining.received_asset = Some("BTC".to_owned());
        mining.received_amount = Some(dec!(0.01));

        let result = calculate(&[mining], SelectionMethod::Fifo);
        assert!(result.income_events.is_empty());
        assert!(result.remaining_lots.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("MINING"));
    }

    #[test]
    fn trade_disposes_sent_leg_and_opens_received_lot() {
        let mut trade = Transaction::new(at(2024, 3, 1), TransactionKind::Trade, "Kraken");
        trade.sent_asset = Some("BTC".to_owned());
        trade.sent_amount = Some(dec!(1));
        trade.sent_price_usd = Some(dec!(60000));
        trade.received_asset = Some("ETH".to_owned());
        trade.received_amount = Some(dec!(20));
        trade.received_price_usd = Some(dec!(3000));

        let transactions = vec![buy(at(2024, 1, 1), "BTC", dec!(1), dec!(40000), "Kraken"), trade];
        let result = calculate(&transactions, SelectionMethod::Fifo);

        assert_eq!(result.disposals.len(), 1);
        assert_eq!(result.disposals[0].asset, "BTC");
        assert_eq!(result.disposals[0].gain, dec!(20000));
        assert_eq!(result.disposals[0].kind, TransactionKind::Trade);

        assert_eq!(result.remaining_lots.len(), 1);
        let lot = &result.remaining_lots[0];
        assert_eq!(lot.asset, "ETH");
        assert_eq!(lot.remaining, dec!(20));
        assert_eq!(lot.basis_per_unit, dec!(3000));
    }

    #[test]
    fn send_moves_nothing_taxable_and_fee_is_disposed() {
        let mut send = Transaction::new(at(2024, 3, 1), TransactionKind::Send, "Coinbase");
        send.sent_asset = Some("BTC".to_owned());
        send.sent_amount = Some(dec!(0.5));
        send.fee_asset = Some("BTC".to_owned());
        send.fee_amount = Some(dec!(0.0001));
        send.fee_usd = Some(dec!(9.5));

        let transactions = vec![buy(at(2024, 1, 1), "BTC", dec!(1), dec!(30000), "Coinbase"), send];
        let result = calculate(&transactions, SelectionMethod::Fifo);

        assert!(result.errors.is_empty(), "{:?}", result.errors);
        // Only the fee is a disposal; the transferred amount is not.
        assert_eq!(result.disposals.len(), 1);
        let fee = &result.disposals[0];
        assert_eq!(fee.amount, dec!(0.0001));
        assert_eq!(fee.proceeds, dec!(9.5));
        assert_eq!(fee.kind, TransactionKind::Spend);
        assert_eq!(fee.cost_basis, dec!(0.0001) * dec!(30000));
    }

    #[test]
    fn send_fee_in_other_asset_warns_and_is_ignored() {
        let mut send = Transaction::new(at(2024, 3, 1), TransactionKind::Send, "Metamask");
        send.sent_asset = Some("USDC".to_owned());
        send.sent_amount = Some(dec!(100));
        send.fee_asset = Some("ETH".to_owned());
        send.fee_amount = Some(dec!(0.002));

        let transactions = vec![
            buy(at(2024, 1, 1), "USDC", dec!(100), dec!(1), "Metamask"),
            send,
        ];
        let result = calculate(&transactions, SelectionMethod::Fifo);

        assert!(result.errors.is_empty());
        assert!(result.disposals.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("differs from sent asset"));
    }

    #[test]
    fn send_fee_shortfall_warns_but_does_not_error() {
        let mut send = Transaction::new(at(2024, 3, 1), TransactionKind::Send, "Coinbase");
        send.sent_asset = Some("BTC".to_owned());
        send.sent_amount = Some(dec!(1));
        send.fee_asset = Some("BTC".to_owned());
        send.fee_amount = Some(dec!(0.0001));

        // Exactly 1 BTC available: the send consumes it all, the fee has
        // nothing left to consume.
        let transactions = vec![buy(at(2024, 1, 1), "BTC", dec!(1), dec!(30000), "Coinbase"), send];
        let result = calculate(&transactions, SelectionMethod::Fifo);

        assert!(result.errors.is_empty());
        assert!(result.disposals.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("transfer fee skipped"));
    }

    #[test]
    fn buy_basis_is_received_leg_unit_price() {
        // A BUY with a USD sent leg and a fee: basis stays the received leg's
        // unit price, the cash side does not participate.
        let mut tx = buy(at(2024, 1, 1), "BTC", dec!(1), dec!(30000), "Coinbase");
        tx.sent_asset = Some("USD".to_owned());
        tx.sent_amount = Some(dec!(30100));
        tx.fee_usd = Some(dec!(100));

        let result = calculate(&[tx], SelectionMethod::Fifo);
        assert_eq!(result.remaining_lots[0].basis_per_unit, dec!(30000));
    }

    #[test]
    fn sell_without_price_is_an_error() {
        let mut tx = Transaction::new(at(2024, 1, 2), TransactionKind::Sell, "Coinbase");
        tx.sent_asset = Some("BTC".to_owned());
        tx.sent_amount = Some(dec!(1));

        let transactions = vec![buy(at(2024, 1, 1), "BTC", dec!(1), dec!(30000), "Coinbase"), tx];
        let result = calculate(&transactions, SelectionMethod::Fifo);

        assert!(result.disposals.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("price required"));
        // The failed sell consumed nothing.
        assert_eq!(result.remaining_lots.len(), 1);
        assert_eq!(result.remaining_lots[0].remaining, dec!(1));
    }
}
