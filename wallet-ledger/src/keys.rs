//! Storage key layouts
//!
//! Index keys embed big-endian creation timestamps so that a forward scan
//! over a prefix returns rows oldest first.
//!
//! | Column family    | Key                                                   |
//! |------------------|-------------------------------------------------------|
//! | `accounts`       | account_id                                            |
//! | `wallets`        | wallet_id                                             |
//! | `balances`       | owner (17) ‖ symbol                                   |
//! | `lots`           | lot_id                                                |
//! | `open_lots`      | wallet_id ‖ len(symbol) ‖ symbol ‖ created_at ‖ lot_id |
//! | `lot_history`    | same layout as `open_lots`, every lot                 |
//! | `entries`        | entry_id                                              |
//! | `entry_details`  | entry_id                                              |
//! | `owner_entries`  | owner (17) ‖ created_at ‖ entry_id                    |
//! | `references`     | reference bytes                                       |
//! | `user_accounts`  | user_id ‖ account_id                                  |

use crate::types::{AccountId, AssetSymbol, BalanceOwner, EntryId, LotId, UserId, WalletId};

/// Encoded owner length: tag byte plus 16 id bytes
pub const OWNER_KEY_LEN: usize = 17;

const TAG_ACCOUNT: u8 = b'A';
const TAG_WALLET: u8 = b'W';

/// Fixed-width owner prefix
pub fn owner_key(owner: &BalanceOwner) -> Vec<u8> {
    let mut key = Vec::with_capacity(OWNER_KEY_LEN);
    match owner {
        BalanceOwner::Account(id) => {
            key.push(TAG_ACCOUNT);
            key.extend_from_slice(id.as_bytes());
        }
        BalanceOwner::Wallet(id) => {
            key.push(TAG_WALLET);
            key.extend_from_slice(id.as_bytes());
        }
    }
    key
}

/// Balance row key
pub fn balance_key(owner: &BalanceOwner, asset: &AssetSymbol) -> Vec<u8> {
    let mut key = owner_key(owner);
    key.extend_from_slice(asset.as_str().as_bytes());
    key
}

/// Prefix covering every lot index row of one (wallet, asset)
pub fn lot_index_prefix(wallet_id: &WalletId, asset: &AssetSymbol) -> Vec<u8> {
    let symbol = asset.as_str().as_bytes();
    let mut key = Vec::with_capacity(16 + 1 + symbol.len() + 8 + 16);
    key.extend_from_slice(wallet_id.as_bytes());
    // AssetSymbol::MAX_LEN keeps this within one byte
    key.push(symbol.len() as u8);
    key.extend_from_slice(symbol);
    key
}

/// Lot index row key, ordered by creation time
pub fn lot_index_key(
    wallet_id: &WalletId,
    asset: &AssetSymbol,
    created_at_nanos: u64,
    lot_id: &LotId,
) -> Vec<u8> {
    let mut key = lot_index_prefix(wallet_id, asset);
    key.extend_from_slice(&created_at_nanos.to_be_bytes());
    key.extend_from_slice(lot_id.as_bytes());
    key
}

/// Owner entry index row key, ordered by creation time
pub fn owner_entry_key(owner: &BalanceOwner, created_at_nanos: u64, entry_id: &EntryId) -> Vec<u8> {
    let mut key = owner_key(owner);
    key.extend_from_slice(&created_at_nanos.to_be_bytes());
    key.extend_from_slice(entry_id.as_bytes());
    key
}

/// Idempotency reference key, namespaced by account
pub fn reference_key(scope: &BalanceOwner, reference: &str) -> Vec<u8> {
    let mut key = owner_key(scope);
    key.extend_from_slice(reference.as_bytes());
    key
}

/// User account index key; v7 account ids keep a user's accounts in opening order
pub fn user_account_key(user_id: &UserId, account_id: &AccountId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(account_id.as_bytes());
    key
}

/// Trailing 16-byte id of an index key
pub fn trailing_id(key: &[u8]) -> Option<uuid::Uuid> {
    if key.len() < 16 {
        return None;
    }
    let bytes: [u8; 16] = key[key.len() - 16..].try_into().ok()?;
    Some(uuid::Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LotId;

    #[test]
    fn test_owner_keys_do_not_collide() {
        let uuid = uuid::Uuid::now_v7();
        let account = BalanceOwner::Account(AccountId::from_uuid(uuid));
        let wallet = BalanceOwner::Wallet(WalletId::from_uuid(uuid));
        assert_ne!(owner_key(&account), owner_key(&wallet));
        assert_eq!(owner_key(&account).len(), OWNER_KEY_LEN);
    }

    #[test]
    fn test_lot_index_orders_by_time() {
        let wallet = WalletId::new();
        let btc = AssetSymbol::new("BTC").unwrap();
        let older = lot_index_key(&wallet, &btc, 1_000, &LotId::new());
        let newer = lot_index_key(&wallet, &btc, 2_000, &LotId::new());
        assert!(older < newer);
        assert!(older.starts_with(&lot_index_prefix(&wallet, &btc)));
    }

    #[test]
    fn test_symbol_prefixes_are_disjoint() {
        // "BTC" must not be a prefix of "BTCB" rows
        let wallet = WalletId::new();
        let btc = lot_index_prefix(&wallet, &AssetSymbol::new("BTC").unwrap());
        let btcb = lot_index_key(&wallet, &AssetSymbol::new("BTCB").unwrap(), 1, &LotId::new());
        assert!(!btcb.starts_with(&btc));
    }

    #[test]
    fn test_trailing_id() {
        let lot = LotId::new();
        let key = lot_index_key(&WalletId::new(), &AssetSymbol::new("ETH").unwrap(), 42, &lot);
        assert_eq!(trailing_id(&key), Some(lot.as_uuid()));
    }
}
