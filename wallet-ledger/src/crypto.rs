//! Journal entry hashing
//!
//! Each entry carries a SHA-256 digest over its immutable fields, computed
//! from their bincode encoding. Status and `updated_at` are excluded because
//! the status machine changes them after the entry is written.

use crate::{types::LedgerEntry, Result};
use sha2::{Digest, Sha256};

/// SHA-256 hash of arbitrary bytes
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Canonical bytes covered by an entry's digest
pub fn canonical_bytes(entry: &LedgerEntry) -> Result<Vec<u8>> {
    let body = (
        &entry.id,
        &entry.entry_type,
        &entry.account_id,
        &entry.wallet_id,
        &entry.asset,
        &entry.amount,
        &entry.fee,
        &entry.reference,
        &entry.related_entry_id,
        &entry.effects,
        &entry.metadata,
        &entry.created_at,
    );
    Ok(bincode::serialize(&body)?)
}

/// Digest of an entry's immutable fields
pub fn hash_entry(entry: &LedgerEntry) -> Result<[u8; 32]> {
    Ok(sha256(&canonical_bytes(entry)?))
}

/// Whether the stored digest matches the entry content
pub fn verify_entry(entry: &LedgerEntry) -> Result<bool> {
    Ok(hash_entry(entry)? == entry.digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AccountId, AssetSymbol, BalanceEffect, BalanceOwner, EntryId, EntryStatus, EntryType,
    };
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn to_hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn entry() -> LedgerEntry {
        let account_id = AccountId::new();
        let asset = AssetSymbol::new("USD").unwrap();
        let mut entry = LedgerEntry {
            id: EntryId::new(),
            entry_type: EntryType::Deposit,
            status: EntryStatus::Completed,
            account_id,
            wallet_id: None,
            asset: asset.clone(),
            amount: Decimal::new(10000, 2),
            fee: Decimal::ZERO,
            reference: Some("dep-1".to_string()),
            related_entry_id: None,
            effects: vec![BalanceEffect::available(
                BalanceOwner::Account(account_id),
                asset,
                Decimal::new(10000, 2),
            )],
            metadata: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            digest: [0u8; 32],
        };
        entry.digest = hash_entry(&entry).unwrap();
        entry
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            to_hex(&sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_status_change_keeps_digest_valid() {
        let mut entry = entry();
        entry.status = EntryStatus::Cancelled;
        entry.updated_at = Utc::now();
        assert!(verify_entry(&entry).unwrap());
    }

    #[test]
    fn test_amount_tampering_detected() {
        let mut entry = entry();
        entry.amount = Decimal::new(1, 0);
        assert!(!verify_entry(&entry).unwrap());
    }
}
