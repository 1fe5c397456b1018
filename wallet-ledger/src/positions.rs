//! Position tracker
//!
//! Cost-basis accounting per (wallet, asset). Each buy creates a lot (or
//! folds every open lot plus the purchase into one consolidated lot); each
//! sell consumes open lots oldest first unless the caller names a lot.
//!
//! The position row in `balances` always equals the sum of the open lots'
//! remaining amounts. Lot rows are only written while the unit of work holds
//! the position row lock, so the open-lot index scan is consistent with the
//! position it is checked against.

use crate::{
    balances,
    config::LedgerRules,
    keys,
    storage::{Storage, CF_BALANCES, CF_LOTS, CF_LOT_HISTORY, CF_OPEN_LOTS},
    types::{
        checked_add, checked_div, checked_mul, timestamp_nanos, AssetBalance, AssetSymbol,
        BalanceOwner, LotConsumption, LotId, PositionLot, PositionView, WalletId,
    },
    unit_of_work::UnitOfWork,
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

/// Result of adding to a position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyOutcome {
    /// Lot holding the purchase
    pub lot: PositionLot,
    /// Lots folded into `lot`
    pub merged: Vec<LotId>,
    /// Position after the purchase
    pub position: AssetBalance,
}

/// Result of taking from a position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellOutcome {
    /// Lots consumed, in consumption order
    pub consumed: Vec<LotConsumption>,
    /// `Σ (price - lot price) × taken`
    pub realized_pnl: Decimal,
    /// Position after the sale
    pub position: AssetBalance,
}

/// How a sell picks its lots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LotSelection {
    /// Oldest open lots first
    Fifo,
    /// One lot only
    Lot(LotId),
    /// A fixed amount from one lot, the rest oldest first
    LotThenFifo(LotId, Decimal),
}

impl LotSelection {
    /// Selection from the optional lot id and lot amount of a request
    pub fn from_request(lot_id: Option<LotId>, lot_amount: Option<Decimal>) -> Result<Self> {
        match (lot_id, lot_amount) {
            (None, None) => Ok(LotSelection::Fifo),
            (Some(id), None) => Ok(LotSelection::Lot(id)),
            (Some(id), Some(amount)) => Ok(LotSelection::LotThenFifo(id, amount)),
            (None, Some(_)) => Err(Error::Validation(
                "Lot amount given without a lot id".to_string(),
            )),
        }
    }
}

/// Lot-based cost-basis accounting
#[derive(Debug, Clone)]
pub struct PositionTracker {
    storage: Arc<Storage>,
    rules: LedgerRules,
}

impl PositionTracker {
    /// Create tracker over storage
    pub fn new(storage: Arc<Storage>, rules: LedgerRules) -> Self {
        Self { storage, rules }
    }

    /// Add `amount` bought at `price` to a wallet position
    ///
    /// The new average price is computed from an unlocked read of the
    /// position and written with a compare-and-swap on its version. With
    /// `create_new_lot` off, every open lot is closed into one consolidated
    /// lot priced at the weighted average, dated like the oldest lot it
    /// absorbs.
    pub fn apply_buy(
        &self,
        uow: &UnitOfWork<'_>,
        wallet_id: WalletId,
        asset: &AssetSymbol,
        amount: Decimal,
        price: Decimal,
        create_new_lot: bool,
    ) -> Result<BuyOutcome> {
        let owner = BalanceOwner::Wallet(wallet_id);
        let snapshot = balances::load(uow, owner, asset)?;

        let total = checked_add(snapshot.available, amount)?;
        let average = match snapshot.average_acquisition_price {
            Some(old) if snapshot.available > Decimal::ZERO => self.rules.round_price(checked_div(
                checked_add(checked_mul(snapshot.available, old)?, checked_mul(amount, price)?)?,
                total,
            )?),
            _ => price,
        };

        let mut next = snapshot.clone();
        next.available = total;
        next.average_acquisition_price = Some(average);
        // Holds the position lock from here on
        let position = balances::compare_and_swap(uow, snapshot.version, next)?;

        let now = Utc::now();
        let lot_id = LotId::new();
        let mut merged = Vec::new();
        let lot = if create_new_lot {
            PositionLot {
                id: lot_id,
                wallet_id,
                asset: asset.clone(),
                original_amount: amount,
                remaining_amount: amount,
                unit_acquisition_price: price,
                created_at: now,
                closed_at: None,
                merged_into: None,
            }
        } else {
            let open = self.open_lots_in(uow, wallet_id, asset)?;
            let mut remaining = amount;
            let mut cost = checked_mul(amount, price)?;
            let mut created_at = now;
            for mut old in open {
                remaining = checked_add(remaining, old.remaining_amount)?;
                cost = checked_add(
                    cost,
                    checked_mul(old.remaining_amount, old.unit_acquisition_price)?,
                )?;
                created_at = created_at.min(old.created_at);

                uow.delete(CF_OPEN_LOTS, &open_index_key(&old))?;
                old.remaining_amount = Decimal::ZERO;
                old.closed_at = Some(now);
                old.merged_into = Some(lot_id);
                uow.put(CF_LOTS, old.id.as_bytes(), &old)?;
                merged.push(old.id);
            }
            PositionLot {
                id: lot_id,
                wallet_id,
                asset: asset.clone(),
                original_amount: remaining,
                remaining_amount: remaining,
                unit_acquisition_price: self.rules.round_price(checked_div(cost, remaining)?),
                created_at,
                closed_at: None,
                merged_into: None,
            }
        };

        uow.put(CF_LOTS, lot.id.as_bytes(), &lot)?;
        uow.put_marker(CF_OPEN_LOTS, &open_index_key(&lot))?;
        uow.put_marker(CF_LOT_HISTORY, &open_index_key(&lot))?;

        debug!(
            wallet_id = %wallet_id,
            asset = %asset,
            lot_id = %lot.id,
            amount = %amount,
            merged = merged.len(),
            "Lot created"
        );

        Ok(BuyOutcome {
            lot,
            merged,
            position,
        })
    }

    /// Take `amount` from a wallet position at `price`
    ///
    /// The whole plan is computed before any lot is written; if the eligible
    /// lots cannot cover `amount` nothing changes.
    pub fn apply_sell(
        &self,
        uow: &UnitOfWork<'_>,
        wallet_id: WalletId,
        asset: &AssetSymbol,
        amount: Decimal,
        price: Decimal,
        selection: LotSelection,
    ) -> Result<SellOutcome> {
        let owner = BalanceOwner::Wallet(wallet_id);
        let mut position = balances::load_for_update(uow, owner, asset)?;
        let open = self.open_lots_in(uow, wallet_id, asset)?;

        let plan = plan_consumption(&open, amount, selection)?;
        if position.available < amount {
            return Err(Error::InvariantViolation(format!(
                "Position {} {} holds {} but its lots cover {}",
                owner, asset, position.available, amount
            )));
        }

        let now = Utc::now();
        let mut consumed = Vec::with_capacity(plan.len());
        let mut realized_pnl = Decimal::ZERO;
        for (mut lot, take) in plan {
            lot.remaining_amount -= take;
            if lot.remaining_amount == Decimal::ZERO {
                lot.closed_at = Some(now);
                uow.delete(CF_OPEN_LOTS, &open_index_key(&lot))?;
            }
            uow.put(CF_LOTS, lot.id.as_bytes(), &lot)?;

            realized_pnl = checked_add(
                realized_pnl,
                checked_mul(price - lot.unit_acquisition_price, take)?,
            )?;
            consumed.push(LotConsumption {
                lot_id: lot.id,
                amount: take,
                unit_acquisition_price: lot.unit_acquisition_price,
                remaining_after: lot.remaining_amount,
            });
        }

        position.available -= amount;
        if position.available == Decimal::ZERO {
            position.average_acquisition_price = None;
        }
        balances::store(uow, &mut position)?;

        debug!(
            wallet_id = %wallet_id,
            asset = %asset,
            amount = %amount,
            lots = consumed.len(),
            "Lots consumed"
        );

        Ok(SellOutcome {
            consumed,
            realized_pnl: self.rules.round_amount(realized_pnl),
            position,
        })
    }

    /// Open lots as seen by the unit of work, oldest first
    pub(crate) fn open_lots_in(
        &self,
        uow: &UnitOfWork<'_>,
        wallet_id: WalletId,
        asset: &AssetSymbol,
    ) -> Result<Vec<PositionLot>> {
        let prefix = keys::lot_index_prefix(&wallet_id, asset);
        let mut lots = Vec::new();
        for key in uow.prefix_keys(CF_OPEN_LOTS, &prefix)? {
            let lot_id = index_lot_id(&key)?;
            let lot: PositionLot = uow.get(CF_LOTS, lot_id.as_bytes())?.ok_or_else(|| {
                Error::InvariantViolation(format!("Open lot index points at missing lot {}", lot_id))
            })?;
            lots.push(lot);
        }
        Ok(lots)
    }

    // Committed-state queries

    /// Every lot ever created for a position, oldest first
    pub fn lots(&self, wallet_id: WalletId, asset: &AssetSymbol) -> Result<Vec<PositionLot>> {
        self.load_indexed(CF_LOT_HISTORY, wallet_id, asset)
    }

    /// Lots with a remaining amount, oldest first
    pub fn open_lots(&self, wallet_id: WalletId, asset: &AssetSymbol) -> Result<Vec<PositionLot>> {
        self.load_indexed(CF_OPEN_LOTS, wallet_id, asset)
    }

    /// Get lot by id
    pub fn lot(&self, lot_id: LotId) -> Result<Option<PositionLot>> {
        self.storage.get(CF_LOTS, lot_id.as_bytes())
    }

    /// Position row and its full lot history
    pub fn position(&self, wallet_id: WalletId, asset: &AssetSymbol) -> Result<PositionView> {
        let owner = BalanceOwner::Wallet(wallet_id);
        let balance = self
            .storage
            .get(CF_BALANCES, &keys::balance_key(&owner, asset))?
            .unwrap_or_else(|| AssetBalance::empty(owner, asset.clone()));
        Ok(PositionView {
            balance,
            lots: self.lots(wallet_id, asset)?,
        })
    }

    fn load_indexed(
        &self,
        cf: &str,
        wallet_id: WalletId,
        asset: &AssetSymbol,
    ) -> Result<Vec<PositionLot>> {
        let prefix = keys::lot_index_prefix(&wallet_id, asset);
        let mut lots = Vec::new();
        for key in self.storage.scan_prefix_keys(cf, &prefix)? {
            let lot_id = index_lot_id(&key)?;
            let lot = self.lot(lot_id)?.ok_or_else(|| {
                Error::InvariantViolation(format!("Lot index points at missing lot {}", lot_id))
            })?;
            lots.push(lot);
        }
        Ok(lots)
    }
}

fn open_index_key(lot: &PositionLot) -> Vec<u8> {
    keys::lot_index_key(
        &lot.wallet_id,
        &lot.asset,
        timestamp_nanos(&lot.created_at),
        &lot.id,
    )
}

fn index_lot_id(key: &[u8]) -> Result<LotId> {
    keys::trailing_id(key)
        .map(LotId::from_uuid)
        .ok_or_else(|| Error::InvariantViolation("Malformed lot index key".to_string()))
}

/// Lots and amounts a sell takes, in order
fn plan_consumption(
    open: &[PositionLot],
    amount: Decimal,
    selection: LotSelection,
) -> Result<Vec<(PositionLot, Decimal)>> {
    if amount <= Decimal::ZERO {
        return Err(Error::Validation(format!(
            "Sell amount must be positive, got {}",
            amount
        )));
    }
    if let LotSelection::LotThenFifo(_, lot_amount) = selection {
        if lot_amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "Lot amount must be positive, got {}",
                lot_amount
            )));
        }
    }

    let held: Decimal = open.iter().map(|lot| lot.remaining_amount).sum();

    let (first, fifo_amount, skip) = match selection {
        LotSelection::Fifo => (None, amount, None),
        LotSelection::Lot(lot_id) => {
            let lot = find_open(open, lot_id)?;
            if lot.remaining_amount < amount {
                return Err(Error::InsufficientPosition {
                    required: amount,
                    available: lot.remaining_amount,
                });
            }
            (Some((lot.clone(), amount)), Decimal::ZERO, Some(lot_id))
        }
        LotSelection::LotThenFifo(lot_id, lot_amount) => {
            if lot_amount > amount {
                return Err(Error::Validation(format!(
                    "Lot amount {} exceeds the requested amount {}",
                    lot_amount, amount
                )));
            }
            let lot = find_open(open, lot_id)?;
            if lot.remaining_amount < lot_amount {
                return Err(Error::InsufficientPosition {
                    required: lot_amount,
                    available: lot.remaining_amount,
                });
            }
            (
                Some((lot.clone(), lot_amount)),
                amount - lot_amount,
                Some(lot_id),
            )
        }
    };

    let mut plan = Vec::new();
    plan.extend(first);

    let mut outstanding = fifo_amount;
    for lot in open {
        if outstanding == Decimal::ZERO {
            break;
        }
        if Some(lot.id) == skip {
            continue;
        }
        let take = lot.remaining_amount.min(outstanding);
        plan.push((lot.clone(), take));
        outstanding -= take;
    }

    if outstanding > Decimal::ZERO {
        return Err(Error::InsufficientPosition {
            required: amount,
            available: held,
        });
    }
    Ok(plan)
}

fn find_open(open: &[PositionLot], lot_id: LotId) -> Result<&PositionLot> {
    open.iter().find(|lot| lot.id == lot_id).ok_or_else(|| {
        Error::NotFound(format!("Open lot {} in this position", lot_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn tracker() -> (PositionTracker, Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        (
            PositionTracker::new(storage.clone(), config.rules().unwrap()),
            storage,
            temp_dir,
        )
    }

    fn btc() -> AssetSymbol {
        AssetSymbol::new("BTC").unwrap()
    }

    fn buy(
        tracker: &PositionTracker,
        storage: &Storage,
        wallet_id: WalletId,
        amount: Decimal,
        price: Decimal,
        create_new_lot: bool,
    ) -> BuyOutcome {
        let uow = storage.begin();
        let outcome = tracker
            .apply_buy(&uow, wallet_id, &btc(), amount, price, create_new_lot)
            .unwrap();
        uow.commit().unwrap();
        // Distinct creation timestamps
        std::thread::sleep(std::time::Duration::from_millis(2));
        outcome
    }

    fn sell(
        tracker: &PositionTracker,
        storage: &Storage,
        wallet_id: WalletId,
        amount: Decimal,
        selection: LotSelection,
    ) -> Result<SellOutcome> {
        let uow = storage.begin();
        let outcome = tracker.apply_sell(&uow, wallet_id, &btc(), amount, dec!(60000), selection)?;
        uow.commit()?;
        Ok(outcome)
    }

    fn lot_sum(tracker: &PositionTracker, wallet_id: WalletId) -> Decimal {
        tracker
            .open_lots(wallet_id, &btc())
            .unwrap()
            .iter()
            .map(|lot| lot.remaining_amount)
            .sum()
    }

    #[test]
    fn test_fifo_consumes_oldest_lot_first() {
        let (tracker, storage, _temp) = tracker();
        let wallet_id = WalletId::new();
        let a = buy(&tracker, &storage, wallet_id, dec!(0.01), dec!(40000), true);
        let b = buy(&tracker, &storage, wallet_id, dec!(0.02), dec!(50000), true);

        let outcome = sell(&tracker, &storage, wallet_id, dec!(0.015), LotSelection::Fifo).unwrap();

        let lot_a = tracker.lot(a.lot.id).unwrap().unwrap();
        let lot_b = tracker.lot(b.lot.id).unwrap().unwrap();
        assert_eq!(lot_a.remaining_amount, dec!(0));
        assert!(lot_a.closed_at.is_some());
        assert_eq!(lot_b.remaining_amount, dec!(0.015));

        assert_eq!(outcome.consumed.len(), 2);
        assert_eq!(outcome.consumed[0].lot_id, a.lot.id);
        assert_eq!(outcome.consumed[0].amount, dec!(0.01));
        assert_eq!(outcome.consumed[1].amount, dec!(0.005));
        // 0.01 × 20000 + 0.005 × 10000
        assert_eq!(outcome.realized_pnl, dec!(250));

        assert_eq!(outcome.position.available, dec!(0.015));
        assert_eq!(lot_sum(&tracker, wallet_id), dec!(0.015));
        // Closed lots stay in the history
        assert_eq!(tracker.lots(wallet_id, &btc()).unwrap().len(), 2);
        assert_eq!(tracker.open_lots(wallet_id, &btc()).unwrap().len(), 1);
    }

    #[test]
    fn test_insufficient_position_mutates_nothing() {
        let (tracker, storage, _temp) = tracker();
        let wallet_id = WalletId::new();
        buy(&tracker, &storage, wallet_id, dec!(0.01), dec!(40000), true);
        buy(&tracker, &storage, wallet_id, dec!(0.02), dec!(50000), true);

        let err = sell(&tracker, &storage, wallet_id, dec!(0.05), LotSelection::Fifo).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientPosition { required, available }
                if required == dec!(0.05) && available == dec!(0.03)
        ));
        assert_eq!(lot_sum(&tracker, wallet_id), dec!(0.03));
        assert!(tracker
            .open_lots(wallet_id, &btc())
            .unwrap()
            .iter()
            .all(|lot| lot.remaining_amount == lot.original_amount));
    }

    #[test]
    fn test_specific_lot() {
        let (tracker, storage, _temp) = tracker();
        let wallet_id = WalletId::new();
        buy(&tracker, &storage, wallet_id, dec!(0.01), dec!(40000), true);
        let b = buy(&tracker, &storage, wallet_id, dec!(0.02), dec!(50000), true);

        // More than the named lot holds, even though the position covers it
        assert!(matches!(
            sell(&tracker, &storage, wallet_id, dec!(0.025), LotSelection::Lot(b.lot.id)),
            Err(Error::InsufficientPosition { .. })
        ));

        let outcome =
            sell(&tracker, &storage, wallet_id, dec!(0.02), LotSelection::Lot(b.lot.id)).unwrap();
        assert_eq!(outcome.consumed.len(), 1);
        assert_eq!(outcome.consumed[0].lot_id, b.lot.id);
        assert_eq!(lot_sum(&tracker, wallet_id), dec!(0.01));

        assert!(matches!(
            sell(&tracker, &storage, wallet_id, dec!(0.001), LotSelection::Lot(LotId::new())),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_lot_amount_then_fifo() {
        let (tracker, storage, _temp) = tracker();
        let wallet_id = WalletId::new();
        let a = buy(&tracker, &storage, wallet_id, dec!(0.01), dec!(40000), true);
        let b = buy(&tracker, &storage, wallet_id, dec!(0.02), dec!(50000), true);

        let outcome = sell(
            &tracker,
            &storage,
            wallet_id,
            dec!(0.025),
            LotSelection::LotThenFifo(b.lot.id, dec!(0.02)),
        )
        .unwrap();
        assert_eq!(outcome.consumed[0].lot_id, b.lot.id);
        assert_eq!(outcome.consumed[0].amount, dec!(0.02));
        assert_eq!(outcome.consumed[1].lot_id, a.lot.id);
        assert_eq!(outcome.consumed[1].amount, dec!(0.005));

        assert!(matches!(
            sell(
                &tracker,
                &storage,
                wallet_id,
                dec!(0.001),
                LotSelection::LotThenFifo(a.lot.id, dec!(0.002))
            ),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_non_positive_amounts_leave_lots_untouched() {
        let (tracker, storage, _temp) = tracker();
        let wallet_id = WalletId::new();
        let a = buy(&tracker, &storage, wallet_id, dec!(0.01), dec!(40000), true);

        assert!(matches!(
            sell(
                &tracker,
                &storage,
                wallet_id,
                dec!(0.005),
                LotSelection::LotThenFifo(a.lot.id, dec!(-0.01))
            ),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            sell(&tracker, &storage, wallet_id, dec!(-0.01), LotSelection::Fifo),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            sell(&tracker, &storage, wallet_id, dec!(0), LotSelection::Lot(a.lot.id)),
            Err(Error::Validation(_))
        ));

        let lot = tracker.lot(a.lot.id).unwrap().unwrap();
        assert_eq!(lot.remaining_amount, dec!(0.01));
        assert_eq!(lot_sum(&tracker, wallet_id), dec!(0.01));
    }

    #[test]
    fn test_consolidated_buy_merges_open_lots() {
        let (tracker, storage, _temp) = tracker();
        let wallet_id = WalletId::new();
        let a = buy(&tracker, &storage, wallet_id, dec!(1), dec!(100), true);
        let b = buy(&tracker, &storage, wallet_id, dec!(1), dec!(200), true);

        let merged = buy(&tracker, &storage, wallet_id, dec!(2), dec!(300), false);
        assert_eq!(merged.merged, vec![a.lot.id, b.lot.id]);
        assert_eq!(merged.lot.original_amount, dec!(4));
        assert_eq!(merged.lot.unit_acquisition_price, dec!(225));
        assert_eq!(merged.lot.created_at, a.lot.created_at);
        assert_eq!(merged.position.available, dec!(4));
        assert_eq!(merged.position.average_acquisition_price, Some(dec!(225)));

        let old = tracker.lot(a.lot.id).unwrap().unwrap();
        assert_eq!(old.remaining_amount, dec!(0));
        assert_eq!(old.merged_into, Some(merged.lot.id));
        assert_eq!(tracker.open_lots(wallet_id, &btc()).unwrap().len(), 1);
        assert_eq!(lot_sum(&tracker, wallet_id), dec!(4));
    }

    #[test]
    fn test_average_price_resets_when_flat() {
        let (tracker, storage, _temp) = tracker();
        let wallet_id = WalletId::new();
        buy(&tracker, &storage, wallet_id, dec!(1), dec!(100), true);
        let outcome = sell(&tracker, &storage, wallet_id, dec!(1), LotSelection::Fifo).unwrap();
        assert_eq!(outcome.position.available, dec!(0));
        assert_eq!(outcome.position.average_acquisition_price, None);

        let again = buy(&tracker, &storage, wallet_id, dec!(1), dec!(50), true);
        assert_eq!(again.position.average_acquisition_price, Some(dec!(50)));
    }

    #[test]
    fn test_selection_from_request() {
        assert_eq!(LotSelection::from_request(None, None).unwrap(), LotSelection::Fifo);
        assert!(LotSelection::from_request(None, Some(dec!(1))).is_err());
    }
}
