//! Reconciliation of balances, lots and the journal
//!
//! Every balance row must be reproducible by replaying the balance effects
//! of the applied journal entries touching it, every position must equal the
//! sum of its open lots, and every entry must still match its digest.

use crate::{
    crypto,
    journal::TransactionJournal,
    keys,
    storage::{Storage, CF_BALANCES, CF_ENTRIES, CF_LOTS, CF_OPEN_LOTS},
    types::{
        AssetBalance, AssetSymbol, BalanceOwner, EntryId, LedgerEntry, LotId, PositionLot, WalletId,
    },
    unit_of_work::UnitOfWork,
    Error, Result,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Single broken invariant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditViolation {
    /// Stored row below zero
    NegativeBalance {
        /// Holder
        owner: BalanceOwner,
        /// Asset
        asset: AssetSymbol,
        /// Stored available
        available: Decimal,
        /// Stored locked
        locked: Decimal,
    },
    /// Position differs from the sum of its open lots
    LotMismatch {
        /// Wallet
        wallet_id: WalletId,
        /// Asset
        asset: AssetSymbol,
        /// Stored position
        position: Decimal,
        /// Sum of open lot remainders
        lots: Decimal,
    },
    /// Stored row differs from the journal replay
    JournalMismatch {
        /// Holder
        owner: BalanceOwner,
        /// Asset
        asset: AssetSymbol,
        /// Stored (available, locked)
        stored: (Decimal, Decimal),
        /// Replayed (available, locked)
        replayed: (Decimal, Decimal),
    },
    /// Entry content no longer matches its digest
    DigestMismatch {
        /// Entry
        entry_id: EntryId,
    },
    /// Lot left in the open index with nothing remaining
    StaleOpenLot {
        /// Lot
        lot_id: LotId,
    },
}

/// Outcome of a reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Balance rows compared with the journal
    pub balances_checked: u64,
    /// Positions compared with their lots
    pub positions_checked: u64,
    /// Entry digests verified
    pub entries_checked: u64,
    /// Everything found wrong
    pub violations: Vec<AuditViolation>,
}

impl AuditReport {
    /// No violations found
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Read-only checker over a ledger store
#[derive(Debug, Clone)]
pub struct Auditor {
    storage: Arc<Storage>,
    journal: TransactionJournal,
}

impl Auditor {
    /// Create auditor
    pub fn new(storage: Arc<Storage>, journal: TransactionJournal) -> Self {
        Self { storage, journal }
    }

    /// Compare one position with its open lots
    ///
    /// The position row is read with a shared lock so no trade can change
    /// it (or its lots) while the lots are summed.
    pub fn audit_position(
        &self,
        wallet_id: WalletId,
        asset: &AssetSymbol,
    ) -> Result<Vec<AuditViolation>> {
        let uow = self.storage.begin();
        let violations = self.position_violations(&uow, wallet_id, asset);
        uow.rollback()?;
        violations
    }

    /// Replay the applied journal effects for one balance row
    ///
    /// Returns (available, locked).
    pub fn reconstruct_balance(
        &self,
        owner: BalanceOwner,
        asset: &AssetSymbol,
    ) -> Result<(Decimal, Decimal)> {
        let uow = self.storage.begin();
        let history = self.journal.owner_history_in(&uow, &owner);
        uow.rollback()?;

        let mut available = Decimal::ZERO;
        let mut locked = Decimal::ZERO;
        for entry in history?.iter().filter(|e| e.status.is_applied()) {
            for effect in &entry.effects {
                if effect.owner == owner && effect.asset == *asset {
                    available += effect.available_delta;
                    locked += effect.locked_delta;
                }
            }
        }
        Ok((available, locked))
    }

    /// Check every balance, position and entry
    ///
    /// Entries and balance rows come from one snapshot, so trades committing
    /// during the run cannot show up as journal mismatches.
    pub fn audit_all(&self) -> Result<AuditReport> {
        let mut report = AuditReport::default();
        let (entries, balances): (Vec<LedgerEntry>, Vec<AssetBalance>) =
            self.storage.scan_all_pair(CF_ENTRIES, CF_BALANCES)?;

        // Replay everything once instead of per balance row
        let mut replayed: BTreeMap<(BalanceOwner, AssetSymbol), (Decimal, Decimal)> =
            BTreeMap::new();
        for entry in &entries {
            report.entries_checked += 1;
            if !crypto::verify_entry(entry)? {
                report
                    .violations
                    .push(AuditViolation::DigestMismatch { entry_id: entry.id });
            }
            if !entry.status.is_applied() {
                continue;
            }
            for effect in &entry.effects {
                let sums = replayed
                    .entry((effect.owner, effect.asset.clone()))
                    .or_insert((Decimal::ZERO, Decimal::ZERO));
                sums.0 += effect.available_delta;
                sums.1 += effect.locked_delta;
            }
        }

        for balance in &balances {
            report.balances_checked += 1;
            if balance.available < Decimal::ZERO || balance.locked < Decimal::ZERO {
                report.violations.push(AuditViolation::NegativeBalance {
                    owner: balance.owner,
                    asset: balance.asset.clone(),
                    available: balance.available,
                    locked: balance.locked,
                });
            }

            let stored = (balance.available, balance.locked);
            let expected = replayed
                .remove(&(balance.owner, balance.asset.clone()))
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));
            if stored != expected {
                report.violations.push(AuditViolation::JournalMismatch {
                    owner: balance.owner,
                    asset: balance.asset.clone(),
                    stored,
                    replayed: expected,
                });
            }

            if let BalanceOwner::Wallet(wallet_id) = balance.owner {
                report.positions_checked += 1;
                report
                    .violations
                    .extend(self.audit_position(wallet_id, &balance.asset)?);
            }
        }

        // Effects on rows that were never written
        for ((owner, asset), sums) in replayed {
            if sums != (Decimal::ZERO, Decimal::ZERO) {
                report.violations.push(AuditViolation::JournalMismatch {
                    owner,
                    asset,
                    stored: (Decimal::ZERO, Decimal::ZERO),
                    replayed: sums,
                });
            }
        }

        if report.is_clean() {
            info!(
                balances = report.balances_checked,
                positions = report.positions_checked,
                entries = report.entries_checked,
                "Audit clean"
            );
        } else {
            warn!(violations = report.violations.len(), "Audit found violations");
        }
        Ok(report)
    }

    fn position_violations(
        &self,
        uow: &UnitOfWork<'_>,
        wallet_id: WalletId,
        asset: &AssetSymbol,
    ) -> Result<Vec<AuditViolation>> {
        let owner = BalanceOwner::Wallet(wallet_id);
        let position = uow
            .get_shared::<AssetBalance>(CF_BALANCES, &keys::balance_key(&owner, asset))?
            .map(|b| b.total())
            .unwrap_or(Decimal::ZERO);

        let mut violations = Vec::new();
        let mut lots = Decimal::ZERO;
        for key in uow.prefix_keys(CF_OPEN_LOTS, &keys::lot_index_prefix(&wallet_id, asset))? {
            let lot_id = keys::trailing_id(&key)
                .map(LotId::from_uuid)
                .ok_or_else(|| Error::InvariantViolation("Malformed open lot key".to_string()))?;
            let lot: PositionLot = uow.get(CF_LOTS, lot_id.as_bytes())?.ok_or_else(|| {
                Error::InvariantViolation(format!("Open lot index points at missing lot {}", lot_id))
            })?;
            if !lot.is_open() {
                violations.push(AuditViolation::StaleOpenLot { lot_id });
            }
            lots += lot.remaining_amount;
        }

        if lots != position {
            violations.push(AuditViolation::LotMismatch {
                wallet_id,
                asset: asset.clone(),
                position,
                lots,
            });
        }
        Ok(violations)
    }
}
