//! Account ledger
//!
//! Per-(owner, asset) balance rows with guarded adjustments. A debit locks
//! the row, checks sufficiency and writes the new value in the same unit of
//! work that journals it, so a concurrent debit either waits for the lock
//! or sees the already-reduced balance.
//!
//! Read-modify-write updates that must not hold a lock while computing go
//! through [`compare_and_swap`] against the row's version token instead.

use crate::{
    accounts,
    config::LedgerRules,
    journal::{JournalRecord, NewEntry, TransactionJournal},
    keys,
    operations::AdjustReceipt,
    retry::expect_version,
    storage::{Storage, CF_BALANCES},
    types::{
        checked_add, AccountId, AssetBalance, AssetSymbol, BalanceEffect, BalanceOwner,
        EntryDetail, EntryId, EntryStatus, EntryType, FiatDetail, LedgerEntry,
    },
    unit_of_work::UnitOfWork,
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

/// Current row as seen by the unit of work, or an empty one
pub(crate) fn load(
    uow: &UnitOfWork<'_>,
    owner: BalanceOwner,
    asset: &AssetSymbol,
) -> Result<AssetBalance> {
    Ok(uow
        .get(CF_BALANCES, &keys::balance_key(&owner, asset))?
        .unwrap_or_else(|| AssetBalance::empty(owner, asset.clone())))
}

/// Current row under an exclusive lock, or an empty one
///
/// A missing row is locked too, so two first deposits serialize.
pub(crate) fn load_for_update(
    uow: &UnitOfWork<'_>,
    owner: BalanceOwner,
    asset: &AssetSymbol,
) -> Result<AssetBalance> {
    Ok(uow
        .get_for_update(CF_BALANCES, &keys::balance_key(&owner, asset))?
        .unwrap_or_else(|| AssetBalance::empty(owner, asset.clone())))
}

/// Write a row, bumping its version
pub(crate) fn store(uow: &UnitOfWork<'_>, balance: &mut AssetBalance) -> Result<()> {
    if balance.available < Decimal::ZERO || balance.locked < Decimal::ZERO {
        return Err(Error::InvariantViolation(format!(
            "Negative balance for {} {}: available {}, locked {}",
            balance.owner, balance.asset, balance.available, balance.locked
        )));
    }
    balance.version += 1;
    balance.updated_at = Utc::now();
    uow.put(
        CF_BALANCES,
        &keys::balance_key(&balance.owner, &balance.asset),
        balance,
    )?;

    debug!(
        owner = %balance.owner,
        asset = %balance.asset,
        available = %balance.available,
        locked = %balance.locked,
        version = balance.version,
        "Balance written"
    );
    Ok(())
}

/// Apply a signed effect under the row lock, refusing to go negative
pub(crate) fn apply_effect(uow: &UnitOfWork<'_>, effect: &BalanceEffect) -> Result<AssetBalance> {
    let mut balance = load_for_update(uow, effect.owner, &effect.asset)?;

    let available = checked_add(balance.available, effect.available_delta)?;
    if available < Decimal::ZERO {
        return Err(Error::InsufficientFunds {
            required: -effect.available_delta,
            available: balance.available,
        });
    }
    let locked = checked_add(balance.locked, effect.locked_delta)?;
    if locked < Decimal::ZERO {
        return Err(Error::InsufficientFunds {
            required: -effect.locked_delta,
            available: balance.locked,
        });
    }

    balance.available = available;
    balance.locked = locked;
    store(uow, &mut balance)?;
    Ok(balance)
}

/// Write `next` only if the row still carries `expected_version`
///
/// Fails with `ConcurrencyConflict` when another writer got there first.
pub(crate) fn compare_and_swap(
    uow: &UnitOfWork<'_>,
    expected_version: u64,
    mut next: AssetBalance,
) -> Result<AssetBalance> {
    let current = load_for_update(uow, next.owner, &next.asset)?;
    expect_version(
        &format!("Balance {} {}", next.owner, next.asset),
        expected_version,
        current.version,
    )?;
    next.version = current.version;
    store(uow, &mut next)?;
    Ok(next)
}

/// Balance adjustments, reservations and compensations
#[derive(Debug, Clone)]
pub struct AccountLedger {
    storage: Arc<Storage>,
    journal: TransactionJournal,
    rules: LedgerRules,
}

impl AccountLedger {
    /// Create ledger over storage
    pub fn new(storage: Arc<Storage>, journal: TransactionJournal, rules: LedgerRules) -> Self {
        Self {
            storage,
            journal,
            rules,
        }
    }

    /// Credit (`delta > 0`) or debit (`delta < 0`) an account balance and
    /// journal it as one deposit or withdrawal entry
    ///
    /// A reference already consumed by a completed adjustment of the same
    /// shape returns that adjustment again without touching the balance.
    pub fn adjust_balance(
        &self,
        uow: &UnitOfWork<'_>,
        account_id: AccountId,
        asset: &AssetSymbol,
        delta: Decimal,
        reference: Option<&str>,
        detail: FiatDetail,
    ) -> Result<AdjustReceipt> {
        if delta == Decimal::ZERO {
            return Err(Error::Validation("Adjustment must not be zero".to_string()));
        }
        self.rules.check_amount("Adjustment", delta.abs())?;

        let entry_type = if delta > Decimal::ZERO {
            EntryType::Deposit
        } else {
            EntryType::Withdrawal
        };
        let owner = BalanceOwner::Account(account_id);

        if let Some(reference) = reference {
            if let Some(record) = self.journal.find_reference(uow, account_id, reference)? {
                return self.replay(uow, &record, entry_type, asset, delta.abs());
            }
        }

        accounts::require_active(uow, account_id)?;

        let effect = BalanceEffect::available(owner, asset.clone(), delta);
        let balance = apply_effect(uow, &effect)?;
        let entry = self.journal.append(
            uow,
            NewEntry::new(entry_type, account_id, asset.clone(), delta.abs())
                .with_reference(reference.map(str::to_string))
                .with_effect(effect),
            EntryDetail::Fiat(detail),
        )?;

        info!(
            account_id = %account_id,
            asset = %asset,
            delta = %delta,
            entry_id = %entry.id,
            "Balance adjusted"
        );

        Ok(AdjustReceipt {
            entry_id: entry.id,
            balance,
            replayed: false,
        })
    }

    /// Move `amount` from available to locked
    pub fn lock_funds(
        &self,
        uow: &UnitOfWork<'_>,
        account_id: AccountId,
        asset: &AssetSymbol,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<AdjustReceipt> {
        self.move_locked(uow, EntryType::Lock, account_id, asset, amount, reference)
    }

    /// Move `amount` from locked back to available
    pub fn unlock_funds(
        &self,
        uow: &UnitOfWork<'_>,
        account_id: AccountId,
        asset: &AssetSymbol,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<AdjustReceipt> {
        self.move_locked(uow, EntryType::Unlock, account_id, asset, amount, reference)
    }

    fn move_locked(
        &self,
        uow: &UnitOfWork<'_>,
        entry_type: EntryType,
        account_id: AccountId,
        asset: &AssetSymbol,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<AdjustReceipt> {
        self.rules.check_amount("Amount", amount)?;

        if let Some(reference) = reference {
            if let Some(record) = self.journal.find_reference(uow, account_id, reference)? {
                return self.replay(uow, &record, entry_type, asset, amount);
            }
        }

        accounts::require_active(uow, account_id)?;

        let (available_delta, locked_delta) = match entry_type {
            EntryType::Lock => (-amount, amount),
            _ => (amount, -amount),
        };
        let effect = BalanceEffect {
            owner: BalanceOwner::Account(account_id),
            asset: asset.clone(),
            available_delta,
            locked_delta,
        };
        let balance = apply_effect(uow, &effect)?;
        let entry = self.journal.append(
            uow,
            NewEntry::new(entry_type, account_id, asset.clone(), amount)
                .with_reference(reference.map(str::to_string))
                .with_effect(effect),
            EntryDetail::Fiat(FiatDetail::default()),
        )?;

        info!(
            account_id = %account_id,
            asset = %asset,
            amount = %amount,
            entry_type = entry_type.as_str(),
            "Funds moved"
        );

        Ok(AdjustReceipt {
            entry_id: entry.id,
            balance,
            replayed: false,
        })
    }

    /// Journal a deposit that has not been confirmed yet
    ///
    /// The balance is untouched until [`settle_pending`](Self::settle_pending).
    pub fn record_pending_deposit(
        &self,
        uow: &UnitOfWork<'_>,
        account_id: AccountId,
        asset: &AssetSymbol,
        amount: Decimal,
        reference: Option<&str>,
        detail: FiatDetail,
    ) -> Result<LedgerEntry> {
        self.rules.check_amount("Deposit", amount)?;

        if let Some(reference) = reference {
            if let Some(record) = self.journal.find_reference(uow, account_id, reference)? {
                let entry = record.entry;
                if entry.entry_type != EntryType::Deposit
                    || entry.status == EntryStatus::Failed
                    || entry.asset != *asset
                    || entry.amount != amount
                {
                    return Err(Error::Validation(format!(
                        "Reference {:?} belongs to a different operation",
                        reference
                    )));
                }
                return Ok(entry);
            }
        }

        accounts::require_active(uow, account_id)?;

        let effect = BalanceEffect::available(BalanceOwner::Account(account_id), asset.clone(), amount);
        let entry = self.journal.append(
            uow,
            NewEntry::new(EntryType::Deposit, account_id, asset.clone(), amount)
                .with_status(EntryStatus::Pending)
                .with_reference(reference.map(str::to_string))
                .with_effect(effect),
            EntryDetail::Fiat(detail),
        )?;

        info!(account_id = %account_id, entry_id = %entry.id, amount = %amount, "Pending deposit recorded");
        Ok(entry)
    }

    /// Confirm a pending deposit and credit its balance
    pub fn settle_pending(&self, uow: &UnitOfWork<'_>, entry_id: EntryId) -> Result<AdjustReceipt> {
        let mut entry = self.journal.load_for_update(uow, entry_id)?;
        if entry.entry_type != EntryType::Deposit {
            return Err(Error::Validation(format!(
                "Entry {} is a {}, not a deposit",
                entry_id,
                entry.entry_type.as_str()
            )));
        }
        accounts::require_active(uow, entry.account_id)?;
        self.journal
            .transition(uow, &mut entry, EntryStatus::Completed)?;

        let mut balance = None;
        for effect in &entry.effects {
            balance = Some(apply_effect(uow, effect)?);
        }
        let balance = balance.ok_or_else(|| {
            Error::InvariantViolation(format!("Pending entry {} has no effects", entry_id))
        })?;

        info!(entry_id = %entry_id, account_id = %entry.account_id, "Pending deposit settled");
        Ok(AdjustReceipt {
            entry_id,
            balance,
            replayed: false,
        })
    }

    /// Abandon a pending deposit
    pub fn fail_pending(&self, uow: &UnitOfWork<'_>, entry_id: EntryId) -> Result<LedgerEntry> {
        let mut entry = self.journal.load_for_update(uow, entry_id)?;
        self.journal.transition(uow, &mut entry, EntryStatus::Failed)?;

        info!(entry_id = %entry_id, "Pending deposit failed");
        Ok(entry)
    }

    /// Compensate a completed deposit or withdrawal
    ///
    /// Applies the opposite effects (guarded, so a spent deposit cannot be
    /// reversed), appends a linked `Reversal` entry and marks the original
    /// `Cancelled`.
    pub fn reverse_entry(
        &self,
        uow: &UnitOfWork<'_>,
        entry_id: EntryId,
        reason: &str,
    ) -> Result<AdjustReceipt> {
        let mut original = self.journal.load_for_update(uow, entry_id)?;
        if !original.entry_type.is_reversible() {
            return Err(Error::Validation(format!(
                "{} entries cannot be reversed",
                original.entry_type.as_str()
            )));
        }
        self.journal
            .transition(uow, &mut original, EntryStatus::Cancelled)?;

        let mut new = NewEntry::new(
            EntryType::Reversal,
            original.account_id,
            original.asset.clone(),
            original.amount,
        )
        .with_related(original.id)
        .with_metadata("reason", reason);

        let mut balance = None;
        for effect in &original.effects {
            let inverse = effect.inverse();
            balance = Some(apply_effect(uow, &inverse)?);
            new = new.with_effect(inverse);
        }
        let balance = balance.ok_or_else(|| {
            Error::InvariantViolation(format!("Entry {} has no effects", entry_id))
        })?;

        let reversal = self
            .journal
            .append(uow, new, EntryDetail::Fiat(FiatDetail::default()))?;

        info!(
            entry_id = %entry_id,
            reversal_id = %reversal.id,
            reason,
            "Entry reversed"
        );
        Ok(AdjustReceipt {
            entry_id: reversal.id,
            balance,
            replayed: false,
        })
    }

    fn replay(
        &self,
        uow: &UnitOfWork<'_>,
        record: &JournalRecord,
        entry_type: EntryType,
        asset: &AssetSymbol,
        amount: Decimal,
    ) -> Result<AdjustReceipt> {
        let entry = &record.entry;
        if entry.entry_type != entry_type || entry.asset != *asset || entry.amount != amount {
            return Err(Error::Validation(format!(
                "Reference {:?} belongs to a different operation",
                entry.reference
            )));
        }
        if entry.status != EntryStatus::Completed {
            return Err(Error::Validation(format!(
                "Reference {:?} belongs to a {:?} entry",
                entry.reference, entry.status
            )));
        }

        debug!(entry_id = %entry.id, "Replaying completed adjustment");
        Ok(AdjustReceipt {
            entry_id: entry.id,
            balance: load(uow, BalanceOwner::Account(entry.account_id), asset)?,
            replayed: true,
        })
    }

    // Committed-state queries

    /// Committed balance row
    pub fn balance(&self, owner: BalanceOwner, asset: &AssetSymbol) -> Result<Option<AssetBalance>> {
        self.storage
            .get(CF_BALANCES, &keys::balance_key(&owner, asset))
    }

    /// Every committed balance row of an owner
    pub fn balances(&self, owner: BalanceOwner) -> Result<Vec<AssetBalance>> {
        self.storage
            .scan_prefix(CF_BALANCES, &keys::owner_key(&owner))
    }

    /// Every committed balance row
    pub fn all_balances(&self) -> Result<Vec<AssetBalance>> {
        self.storage.scan_all(CF_BALANCES)
    }
}
