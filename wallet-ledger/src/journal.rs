//! Transaction journal
//!
//! Append-only record of every balance-affecting operation. Each entry is
//! written together with its type-specific extension row, one index row per
//! balance owner it touches, and (when supplied) its idempotency reference,
//! all inside the caller's unit of work.
//!
//! Entries are never deleted and their amounts never change. The only
//! mutable part is the status:
//!
//! ```text
//! Pending -> Completed | Failed
//! Completed -> Cancelled   (only alongside a new Reversal entry)
//! ```

use crate::{
    crypto,
    keys::{self, OWNER_KEY_LEN},
    storage::{Storage, CF_ENTRIES, CF_ENTRY_DETAILS, CF_OWNER_ENTRIES, CF_REFERENCES},
    types::{
        timestamp_nanos, AccountId, AssetSymbol, BalanceEffect, BalanceOwner, EntryDetail,
        EntryId, EntryStatus, EntryType, LedgerEntry, WalletId,
    },
    unit_of_work::UnitOfWork,
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Longest accepted idempotency reference
pub const MAX_REFERENCE_LEN: usize = 128;

/// Entry content before it is hashed and stored
#[derive(Debug, Clone)]
pub struct NewEntry {
    /// Preassigned id, for entries that must reference each other
    pub id: Option<EntryId>,
    /// Operation type
    pub entry_type: EntryType,
    /// Initial status
    pub status: EntryStatus,
    /// Account the operation runs under
    pub account_id: AccountId,
    /// Wallet, for trades
    pub wallet_id: Option<WalletId>,
    /// Primary asset
    pub asset: AssetSymbol,
    /// Primary amount
    pub amount: Decimal,
    /// Fee charged
    pub fee: Decimal,
    /// Idempotency reference
    pub reference: Option<String>,
    /// Linked entry
    pub related_entry_id: Option<EntryId>,
    /// Balance changes
    pub effects: Vec<BalanceEffect>,
    /// Additional metadata
    pub metadata: BTreeMap<String, String>,
}

impl NewEntry {
    /// Completed entry with no fee, reference or effects
    pub fn new(
        entry_type: EntryType,
        account_id: AccountId,
        asset: AssetSymbol,
        amount: Decimal,
    ) -> Self {
        Self {
            id: None,
            entry_type,
            status: EntryStatus::Completed,
            account_id,
            wallet_id: None,
            asset,
            amount,
            fee: Decimal::ZERO,
            reference: None,
            related_entry_id: None,
            effects: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Use a preassigned id
    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set initial status
    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    /// Set wallet
    pub fn with_wallet(mut self, wallet_id: WalletId) -> Self {
        self.wallet_id = Some(wallet_id);
        self
    }

    /// Set fee
    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    /// Set idempotency reference
    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    /// Link to another entry
    pub fn with_related(mut self, related: EntryId) -> Self {
        self.related_entry_id = Some(related);
        self
    }

    /// Add a balance effect
    pub fn with_effect(mut self, effect: BalanceEffect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Add a metadata pair
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Entry plus its extension row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Primary entry
    pub entry: LedgerEntry,
    /// Fiat or crypto extension
    pub detail: EntryDetail,
}

/// Append-only journal over the store
#[derive(Debug, Clone)]
pub struct TransactionJournal {
    storage: Arc<Storage>,
}

impl TransactionJournal {
    /// Create journal over storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Append an entry, its extension row and index rows
    ///
    /// Fails with `Validation` if the reference is already taken.
    pub fn append(
        &self,
        uow: &UnitOfWork<'_>,
        new: NewEntry,
        detail: EntryDetail,
    ) -> Result<LedgerEntry> {
        let id = new.id.unwrap_or_default();
        if let Some(reference) = &new.reference {
            validate_reference(reference)?;
            let key = keys::reference_key(&BalanceOwner::Account(new.account_id), reference);
            if uow.get_for_update::<EntryId>(CF_REFERENCES, &key)?.is_some() {
                return Err(Error::Validation(format!(
                    "Reference {:?} already used",
                    reference
                )));
            }
            uow.put(CF_REFERENCES, &key, &id)?;
        }

        let now = Utc::now();
        let mut entry = LedgerEntry {
            id,
            entry_type: new.entry_type,
            status: new.status,
            account_id: new.account_id,
            wallet_id: new.wallet_id,
            asset: new.asset,
            amount: new.amount,
            fee: new.fee,
            reference: new.reference,
            related_entry_id: new.related_entry_id,
            effects: new.effects,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
            digest: [0u8; 32],
        };
        entry.digest = crypto::hash_entry(&entry)?;

        uow.put(CF_ENTRIES, entry.id.as_bytes(), &entry)?;
        uow.put(CF_ENTRY_DETAILS, entry.id.as_bytes(), &detail)?;

        let nanos = timestamp_nanos(&entry.created_at);
        let mut owners: BTreeSet<BalanceOwner> =
            entry.effects.iter().map(|effect| effect.owner).collect();
        owners.insert(BalanceOwner::Account(entry.account_id));
        for owner in &owners {
            uow.put_marker(
                CF_OWNER_ENTRIES,
                &keys::owner_entry_key(owner, nanos, &entry.id),
            )?;
        }

        uow.note_entry(entry.entry_type);

        debug!(
            entry_id = %entry.id,
            entry_type = entry.entry_type.as_str(),
            status = ?entry.status,
            account_id = %entry.account_id,
            asset = %entry.asset,
            amount = %entry.amount,
            "Journal entry appended"
        );

        Ok(entry)
    }

    /// Look up the entry holding a reference, locking the reference row
    ///
    /// The lock serializes concurrent requests carrying the same reference.
    pub fn find_reference(
        &self,
        uow: &UnitOfWork<'_>,
        account_id: AccountId,
        reference: &str,
    ) -> Result<Option<JournalRecord>> {
        validate_reference(reference)?;
        let key = keys::reference_key(&BalanceOwner::Account(account_id), reference);
        match uow.get_for_update::<EntryId>(CF_REFERENCES, &key)? {
            Some(entry_id) => Ok(Some(self.record_in(uow, entry_id)?)),
            None => Ok(None),
        }
    }

    /// Entry and extension row as seen by the unit of work
    pub fn record_in(&self, uow: &UnitOfWork<'_>, entry_id: EntryId) -> Result<JournalRecord> {
        let entry: LedgerEntry = uow
            .get(CF_ENTRIES, entry_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("Entry {}", entry_id)))?;
        let detail: EntryDetail = uow
            .get(CF_ENTRY_DETAILS, entry_id.as_bytes())?
            .ok_or_else(|| {
                Error::InvariantViolation(format!("Entry {} has no detail row", entry_id))
            })?;
        Ok(JournalRecord { entry, detail })
    }

    /// Load an entry and lock it for a status change
    pub fn load_for_update(&self, uow: &UnitOfWork<'_>, entry_id: EntryId) -> Result<LedgerEntry> {
        uow.get_for_update(CF_ENTRIES, entry_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("Entry {}", entry_id)))
    }

    /// Move an entry to a new status
    pub fn transition(
        &self,
        uow: &UnitOfWork<'_>,
        entry: &mut LedgerEntry,
        next: EntryStatus,
    ) -> Result<()> {
        if !entry.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: entry.status,
                to: next,
            });
        }

        let from = entry.status;
        entry.status = next;
        entry.updated_at = Utc::now();
        uow.put(CF_ENTRIES, entry.id.as_bytes(), entry)?;

        debug!(entry_id = %entry.id, from = ?from, to = ?next, "Journal entry status changed");
        Ok(())
    }

    /// Entries touching an owner in any status, oldest first, read under the
    /// unit of work
    pub fn owner_history_in(
        &self,
        uow: &UnitOfWork<'_>,
        owner: &BalanceOwner,
    ) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for key in uow.prefix_keys(CF_OWNER_ENTRIES, &keys::owner_key(owner))? {
            let entry_id = index_entry_id(&key)?;
            let entry: LedgerEntry = uow
                .get(CF_ENTRIES, entry_id.as_bytes())?
                .ok_or_else(|| {
                    Error::InvariantViolation(format!("Index points at missing entry {}", entry_id))
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    // Committed-state queries

    /// Get entry by id
    pub fn entry(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>> {
        self.storage.get(CF_ENTRIES, entry_id.as_bytes())
    }

    /// Get entry and extension row by id
    pub fn record(&self, entry_id: EntryId) -> Result<Option<JournalRecord>> {
        let Some(entry) = self.entry(entry_id)? else {
            return Ok(None);
        };
        let detail: EntryDetail = self
            .storage
            .get(CF_ENTRY_DETAILS, entry_id.as_bytes())?
            .ok_or_else(|| {
                Error::InvariantViolation(format!("Entry {} has no detail row", entry_id))
            })?;
        Ok(Some(JournalRecord { entry, detail }))
    }

    /// Committed entry holding a reference
    pub fn by_reference(
        &self,
        account_id: AccountId,
        reference: &str,
    ) -> Result<Option<JournalRecord>> {
        validate_reference(reference)?;
        let key = keys::reference_key(&BalanceOwner::Account(account_id), reference);
        match self.storage.get::<EntryId>(CF_REFERENCES, &key)? {
            Some(entry_id) => self.record(entry_id),
            None => Ok(None),
        }
    }

    /// Latest entries touching an owner, newest first
    pub fn entries(&self, owner: &BalanceOwner, limit: usize) -> Result<Vec<LedgerEntry>> {
        let keys = self.storage.scan_prefix_keys_rev(
            CF_OWNER_ENTRIES,
            &keys::owner_key(owner),
            8 + 16,
            limit,
        )?;
        self.load_indexed(&keys)
    }

    /// Entries touching an owner created in `[from, to)`, newest first
    pub fn entries_between(
        &self,
        owner: &BalanceOwner,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        if from >= to {
            return Err(Error::Validation(format!(
                "Empty date window: {} .. {}",
                from, to
            )));
        }
        let mut start = keys::owner_key(owner);
        start.extend_from_slice(&timestamp_nanos(&from).to_be_bytes());
        let mut end = keys::owner_key(owner);
        end.extend_from_slice(&timestamp_nanos(&to).to_be_bytes());

        let mut keys = self.storage.scan_range_keys(CF_OWNER_ENTRIES, &start, &end)?;
        keys.reverse();
        self.load_indexed(&keys)
    }

    fn load_indexed(&self, keys: &[Box<[u8]>]) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let entry_id = index_entry_id(key)?;
            let entry = self.entry(entry_id)?.ok_or_else(|| {
                Error::InvariantViolation(format!("Index points at missing entry {}", entry_id))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn index_entry_id(key: &[u8]) -> Result<EntryId> {
    if key.len() != OWNER_KEY_LEN + 8 + 16 {
        return Err(Error::InvariantViolation(format!(
            "Malformed owner index key of {} bytes",
            key.len()
        )));
    }
    keys::trailing_id(key)
        .map(EntryId::from_uuid)
        .ok_or_else(|| Error::InvariantViolation("Malformed owner index key".to_string()))
}

fn validate_reference(reference: &str) -> Result<()> {
    if reference.trim().is_empty() {
        return Err(Error::Validation("Reference is empty".to_string()));
    }
    if reference.len() > MAX_REFERENCE_LEN {
        return Err(Error::Validation(format!(
            "Reference longer than {} bytes",
            MAX_REFERENCE_LEN
        )));
    }
    Ok(())
}
