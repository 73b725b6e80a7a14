//! Tax lot inventory.
//!
//! Holdings are a two-level map of wallet → asset → insertion-ordered lots.
//! Consumption is atomic: the selection order and per-lot take amounts are
//! planned against an immutable view first, and the underlying lots are only
//! decremented once the full requested amount is covered. A failed consume
//! therefore leaves the pool exactly as it was.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::base::TransactionKind;

/// Lot selection policy applied when inventory is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub(crate) enum SelectionMethod {
    /// Oldest acquisition first.
    Fifo,
    /// Newest acquisition first.
    Lifo,
    /// Highest cost basis per unit first.
    Hifo,
}

/// A contiguous acquisition of an asset, tracked until fully consumed.
///
/// `remaining` only ever decreases and never drops below zero; `original` is
/// immutable. The wallet is a literal label and is never rewritten; moving
/// inventory between wallets goes through [`LotPool::transfer`], which closes
/// the lot and opens a new one at the destination.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Lot {
    pub id: u64,
    pub asset: String,
    pub remaining: Decimal,
    pub original: Decimal,
    pub basis_per_unit: Decimal,
    pub acquired: DateTime<Utc>,
    pub acquired_as: TransactionKind,
    pub wallet: String,
}

/// Value snapshot of one lot's contribution to a consumption. Does not alias
/// pool state.
#[derive(Debug, Clone)]
pub(crate) struct ConsumedLot {
    pub lot_id: u64,
    pub asset: String,
    pub wallet: String,
    pub amount: Decimal,
    pub basis_per_unit: Decimal,
    pub acquired: DateTime<Utc>,
    pub acquired_as: TransactionKind,
}

#[derive(Debug, Error, PartialEq)]
pub(crate) enum LotError {
    #[error("Insufficient lots: needed {needed} {asset} in wallet '{wallet}', available {available}")]
    InsufficientLots {
        wallet: String,
        asset: String,
        needed: Decimal,
        available: Decimal,
    },
}

#[derive(Debug, Default)]
pub(crate) struct LotPool {
    holdings: HashMap<String, HashMap<String, Vec<Lot>>>,
    next_id: u64,
}

impl LotPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a new lot for `(wallet, asset)`. Lots are never merged, so
    /// acquisitions with different dates or basis stay distinct.
    pub(crate) fn add(
        &mut self,
        wallet: &str,
        asset: &str,
        amount: Decimal,
        basis_per_unit: Decimal,
        acquired: DateTime<Utc>,
        acquired_as: TransactionKind,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.holdings
            .entry(wallet.to_owned())
            .or_default()
            .entry(asset.to_owned())
            .or_default()
            .push(Lot {
                id,
                asset: asset.to_owned(),
                remaining: amount,
                original: amount,
                basis_per_unit,
                acquired,
                acquired_as,
                wallet: wallet.to_owned(),
            });
        id
    }

    /// Consume `amount` of `asset` from `wallet` in the order prescribed by
    /// `method`, returning one snapshot per lot touched.
    ///
    /// Fails with [`LotError::InsufficientLots`] when the wallet holds none of
    /// the asset or not enough of it; in both cases the pool is unchanged.
    /// Fully drained lots are dropped.
    pub(crate) fn consume(
        &mut self,
        wallet: &str,
        asset: &str,
        amount: Decimal,
        method: SelectionMethod,
    ) -> Result<Vec<ConsumedLot>, LotError> {
        let insufficient = |available: Decimal| LotError::InsufficientLots {
            wallet: wallet.to_owned(),
            asset: asset.to_owned(),
            needed: amount,
            available,
        };

        let lots = self
            .holdings
            .get_mut(wallet)
            .and_then(|assets| assets.get_mut(asset))
            .filter(|lots| !lots.is_empty())
            .ok_or_else(|| insufficient(Decimal::ZERO))?;

        // Plan against a sorted view of indices; nothing is mutated until the
        // whole amount is covered.
        let mut order: Vec<usize> = (0..lots.len()).collect();
        match method {
            SelectionMethod::Fifo => order.sort_by_key(|&index| lots[index].acquired),
            SelectionMethod::Lifo => {
                order.sort_by(|&a, &b| lots[b].acquired.cmp(&lots[a].acquired))
            }
            SelectionMethod::Hifo => {
                order.sort_by(|&a, &b| lots[b].basis_per_unit.cmp(&lots[a].basis_per_unit))
            }
        }

        let mut outstanding = amount;
        let mut plan: Vec<(usize, Decimal)> = Vec::new();
        for &index in &order {
            if outstanding.is_zero() {
                break;
            }
            let take = lots[index].remaining.min(outstanding);
            if take > Decimal::ZERO {
                plan.push((index, take));
                outstanding -= take;
            }
        }

        if outstanding > Decimal::ZERO {
            let available: Decimal = lots.iter().map(|lot| lot.remaining).sum();
            return Err(insufficient(available));
        }

        let mut consumed = Vec::with_capacity(plan.len());
        for (index, take) in plan {
            let lot = &mut lots[index];
            consumed.push(ConsumedLot {
                lot_id: lot.id,
                asset: lot.asset.clone(),
                wallet: lot.wallet.clone(),
                amount: take,
                basis_per_unit: lot.basis_per_unit,
                acquired: lot.acquired,
                acquired_as: lot.acquired_as,
            });
            lot.remaining -= take;
        }
        lots.retain(|lot| lot.remaining > Decimal::ZERO);

        Ok(consumed)
    }

    /// Move inventory between wallets without a tax event: consume under FIFO
    /// at the source and reopen each consumed slice at the destination with a
    /// fresh id, preserving basis, acquisition instant and acquisition kind.
    pub(crate) fn transfer(
        &mut self,
        from: &str,
        to: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), LotError> {
        let consumed = self.consume(from, asset, amount, SelectionMethod::Fifo)?;
        for slice in consumed {
            self.add(
                to,
                asset,
                slice.amount,
                slice.basis_per_unit,
                slice.acquired,
                slice.acquired_as,
            );
        }
        Ok(())
    }

    /// Snapshot of every lot with inventory left, across all wallets and
    /// assets, in id order.
    pub(crate) fn remaining_lots(&self) -> Vec<Lot> {
        let mut lots: Vec<Lot> = self
            .holdings
            .values()
            .flat_map(|assets| assets.values())
            .flatten()
            .cloned()
            .collect();
        lots.sort_by_key(|lot| lot.id);
        lots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn day(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn seeded_pool() -> LotPool {
        let mut pool = LotPool::new();
        pool.add("Coinbase", "BTC", dec!(1), dec!(30000), day(1), TransactionKind::Buy);
        pool.add("Coinbase", "BTC", dec!(1), dec!(40000), day(2), TransactionKind::Buy);
        pool.add("Coinbase", "BTC", dec!(1), dec!(35000), day(3), TransactionKind::Buy);
        pool
    }

    #[test]
    fn fifo_consumes_oldest_first() {
        let mut pool = seeded_pool();
        let consumed = pool
            .consume("Coinbase", "BTC", dec!(1.5), SelectionMethod::Fifo)
            .unwrap();

        assert_eq!(consumed.len(), 2);
        assert_eq!(consumed[0].basis_per_unit, dec!(30000));
        assert_eq!(consumed[0].amount, dec!(1));
        assert_eq!(consumed[1].basis_per_unit, dec!(40000));
        assert_eq!(consumed[1].amount, dec!(0.5));
    }

    #[test]
    fn lifo_consumes_newest_first() {
        let mut pool = seeded_pool();
        let consumed = pool
            .consume("Coinbase", "BTC", dec!(1.5), SelectionMethod::Lifo)
            .unwrap();

        assert_eq!(consumed[0].basis_per_unit, dec!(35000));
        assert_eq!(consumed[1].basis_per_unit, dec!(40000));
        assert_eq!(consumed[1].amount, dec!(0.5));
    }

    #[test]
    fn hifo_consumes_highest_basis_first() {
        let mut pool = seeded_pool();
        let consumed = pool
            .consume("Coinbase", "BTC", dec!(1.5), SelectionMethod::Hifo)
            .unwrap();

        assert_eq!(consumed[0].basis_per_unit, dec!(40000));
        assert_eq!(consumed[1].basis_per_unit, dec!(35000));
        assert_eq!(consumed[1].amount, dec!(0.5));
    }

    #[test]
    fn drained_lots_are_dropped_and_partials_kept() {
        let mut pool = seeded_pool();
        pool.consume("Coinbase", "BTC", dec!(1.5), SelectionMethod::Fifo)
            .unwrap();

        let remaining = pool.remaining_lots();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].remaining, dec!(0.5));
        assert_eq!(remaining[0].original, dec!(1));
        assert_eq!(remaining[0].basis_per_unit, dec!(40000));
        assert_eq!(remaining[1].remaining, dec!(1));
    }

    #[test]
    fn consume_is_atomic_on_shortfall() {
        let mut pool = seeded_pool();
        let err = pool
            .consume("Coinbase", "BTC", dec!(5), SelectionMethod::Fifo)
            .unwrap_err();

        assert_eq!(
            err,
            LotError::InsufficientLots {
                wallet: "Coinbase".to_owned(),
                asset: "BTC".to_owned(),
                needed: dec!(5),
                available: dec!(3),
            }
        );
        assert!(err.to_string().contains("Insufficient lots"));

        // Unchanged: all three lots intact.
        let remaining = pool.remaining_lots();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|lot| lot.remaining == dec!(1)));
    }

    #[test]
    fn consume_fails_for_empty_wallet_or_asset() {
        let mut pool = seeded_pool();
        assert!(pool
            .consume("River", "BTC", dec!(1), SelectionMethod::Fifo)
            .is_err());
        assert!(pool
            .consume("Coinbase", "ETH", dec!(1), SelectionMethod::Fifo)
            .is_err());
    }

    #[test]
    fn wallets_and_assets_are_isolated() {
        let mut pool = LotPool::new();
        pool.add("Coinbase", "BTC", dec!(1), dec!(30000), day(1), TransactionKind::Buy);
        pool.add("River", "BTC", dec!(1), dec!(20000), day(1), TransactionKind::Buy);
        pool.add("Coinbase", "ETH", dec!(10), dec!(2000), day(1), TransactionKind::Buy);

        let consumed = pool
            .consume("Coinbase", "BTC", dec!(1), SelectionMethod::Fifo)
            .unwrap();
        assert_eq!(consumed[0].basis_per_unit, dec!(30000));

        let remaining = pool.remaining_lots();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn transfer_preserves_basis_and_acquisition() {
        let mut pool = seeded_pool();
        pool.transfer("Coinbase", "River", "BTC", dec!(1.5)).unwrap();

        let remaining = pool.remaining_lots();
        let moved: Vec<&Lot> = remaining.iter().filter(|lot| lot.wallet == "River").collect();
        assert_eq!(moved.len(), 2);
        assert_eq!(moved[0].basis_per_unit, dec!(30000));
        assert_eq!(moved[0].acquired, day(1));
        assert_eq!(moved[0].remaining, dec!(1));
        assert_eq!(moved[1].basis_per_unit, dec!(40000));
        assert_eq!(moved[1].remaining, dec!(0.5));

        // Fresh ids, original wallet label untouched on what stayed.
        let max_seed_id = 3;
        assert!(moved.iter().all(|lot| lot.id > max_seed_id));
        assert!(remaining
            .iter()
            .filter(|lot| lot.wallet == "Coinbase")
            .all(|lot| lot.remaining > Decimal::ZERO));
    }

    #[test]
    fn lot_conservation_across_operations() {
        let mut pool = seeded_pool();
        let consumed = pool
            .consume("Coinbase", "BTC", dec!(1.2), SelectionMethod::Hifo)
            .unwrap();
        pool.transfer("Coinbase", "River", "BTC", dec!(0.8)).unwrap();

        let consumed_total: Decimal = consumed.iter().map(|slice| slice.amount).sum();
        let remaining_total: Decimal = pool.remaining_lots().iter().map(|lot| lot.remaining).sum();
        assert_eq!(consumed_total + remaining_total, dec!(3));
    }

    #[test]
    fn method_tags_parse_from_wire_spelling() {
        use std::str::FromStr;

        assert_eq!(SelectionMethod::from_str("FIFO").unwrap(), SelectionMethod::Fifo);
        assert_eq!(SelectionMethod::from_str("HIFO").unwrap(), SelectionMethod::Hifo);
        assert_eq!(SelectionMethod::Lifo.to_string(), "LIFO");
        assert!(SelectionMethod::from_str("AVCO").is_err());
    }
}
