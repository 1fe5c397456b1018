//! Storage layer using RocksDB
//!
//! The database is opened as a pessimistic `TransactionDB` so a unit of work
//! can take row locks (`get_for_update`) and commit several column families
//! atomically. Key layouts live in [`crate::keys`].
//!
//! # Column Families
//!
//! - `accounts` - Accounts (key: account_id)
//! - `wallets` - Wallets (key: wallet_id)
//! - `balances` - Asset balances (key: owner || symbol)
//! - `lots` - Cost-basis lots (key: lot_id)
//! - `open_lots` - FIFO index of lots with remaining > 0
//! - `lot_history` - Index of every lot, oldest first
//! - `entries` - Journal entries (key: entry_id)
//! - `entry_details` - Fiat/crypto extension rows (key: entry_id)
//! - `owner_entries` - Entries per balance owner, oldest first
//! - `references` - Idempotency references (value: entry_id)
//! - `user_accounts` - Accounts per user, oldest first

use crate::{
    error::{Error, Result},
    unit_of_work::UnitOfWork,
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, TransactionDB,
    TransactionDBOptions,
};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;

/// Column family names
pub(crate) const CF_ACCOUNTS: &str = "accounts";
pub(crate) const CF_WALLETS: &str = "wallets";
pub(crate) const CF_BALANCES: &str = "balances";
pub(crate) const CF_LOTS: &str = "lots";
pub(crate) const CF_OPEN_LOTS: &str = "open_lots";
pub(crate) const CF_LOT_HISTORY: &str = "lot_history";
pub(crate) const CF_ENTRIES: &str = "entries";
pub(crate) const CF_ENTRY_DETAILS: &str = "entry_details";
pub(crate) const CF_OWNER_ENTRIES: &str = "owner_entries";
pub(crate) const CF_REFERENCES: &str = "references";
pub(crate) const CF_USER_ACCOUNTS: &str = "user_accounts";

const ALL_CFS: [&str; 11] = [
    CF_ACCOUNTS,
    CF_WALLETS,
    CF_BALANCES,
    CF_LOTS,
    CF_OPEN_LOTS,
    CF_LOT_HISTORY,
    CF_ENTRIES,
    CF_ENTRY_DETAILS,
    CF_OWNER_ENTRIES,
    CF_REFERENCES,
    CF_USER_ACCOUNTS,
];

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<TransactionDB>,
    path: PathBuf,
    lock_timeout_ms: i64,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_default_lock_timeout(config.rocksdb.lock_timeout_ms);
        txn_db_opts.set_txn_lock_timeout(config.rocksdb.lock_timeout_ms);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect();

        let db = TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            lock_timeout_ms = config.rocksdb.lock_timeout_ms,
            "Opened RocksDB transaction database"
        );

        Ok(Self {
            db: Arc::new(db),
            path: path.clone(),
            lock_timeout_ms: config.rocksdb.lock_timeout_ms,
        })
    }

    // Column family options

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Journal is append-only and rarely read back
            CF_ENTRIES | CF_ENTRY_DETAILS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            // Index scans benefit from bloom filters
            CF_OPEN_LOTS | CF_LOT_HISTORY | CF_OWNER_ENTRIES | CF_REFERENCES
            | CF_USER_ACCOUNTS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    // Helper: get column family handle

    pub(crate) fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    pub(crate) fn db(&self) -> &TransactionDB {
        &self.db
    }

    pub(crate) fn lock_timeout_ms(&self) -> i64 {
        self.lock_timeout_ms
    }

    /// Start a unit of work backed by one store transaction
    pub fn begin(&self) -> UnitOfWork<'_> {
        UnitOfWork::new(self)
    }

    // Committed-state reads

    /// Get a committed row
    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf_handle(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Committed rows under a prefix, in key order
    pub fn scan_prefix<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let handle = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// Committed index keys under a prefix, in key order
    pub fn scan_prefix_keys(&self, cf: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let handle = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix, Direction::Forward));

        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Committed index keys in `[start, end)`, in key order
    pub fn scan_range_keys(&self, cf: &str, start: &[u8], end: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let handle = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(start, Direction::Forward));

        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if &*key >= end {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Committed index keys under a prefix, newest first
    ///
    /// `suffix_len` is the length of the key part following the prefix;
    /// the scan starts from the largest possible key of that shape.
    pub fn scan_prefix_keys_rev(
        &self,
        cf: &str,
        prefix: &[u8],
        suffix_len: usize,
        limit: usize,
    ) -> Result<Vec<Box<[u8]>>> {
        let handle = self.cf_handle(cf)?;
        let mut upper = prefix.to_vec();
        upper.extend(std::iter::repeat(0xFF).take(suffix_len));

        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(upper.as_slice(), Direction::Reverse));

        let mut keys = Vec::new();
        for item in iter {
            if keys.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Every committed row of a column family
    pub fn scan_all<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let handle = self.cf_handle(cf)?;
        decode_rows(self.db.iterator_cf(handle, IteratorMode::Start))
    }

    /// Every committed row of two column families, read from one snapshot
    ///
    /// Commits landing during the scan are invisible to both halves.
    pub fn scan_all_pair<A, B>(&self, first: &str, second: &str) -> Result<(Vec<A>, Vec<B>)>
    where
        A: DeserializeOwned,
        B: DeserializeOwned,
    {
        let first_handle = self.cf_handle(first)?;
        let second_handle = self.cf_handle(second)?;
        let snapshot = self.db.snapshot();

        let a = decode_rows(snapshot.iterator_cf(first_handle, IteratorMode::Start))?;
        let b = decode_rows(snapshot.iterator_cf(second_handle, IteratorMode::Start))?;
        Ok((a, b))
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_balances: self.count(CF_BALANCES)?,
            total_lots: self.count(CF_LOTS)?,
            open_lots: self.count(CF_OPEN_LOTS)?,
            total_entries: self.count(CF_ENTRIES)?,
        })
    }

    fn count(&self, cf: &str) -> Result<u64> {
        let handle = self.cf_handle(cf)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

fn decode_rows<T, I>(iter: I) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    I: Iterator<Item = std::result::Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>>,
{
    let mut rows = Vec::new();
    for item in iter {
        let (_, value) = item?;
        rows.push(bincode::deserialize(&value)?);
    }
    Ok(rows)
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Balance rows
    pub total_balances: u64,
    /// Lots ever created
    pub total_lots: u64,
    /// Lots with remaining amount
    pub open_lots: u64,
    /// Journal entries
    pub total_entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use crate::types::{AccountId, AssetBalance, AssetSymbol, BalanceOwner};
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (config, temp_dir)
    }

    fn balance(owner: BalanceOwner, symbol: &str, available: i64) -> AssetBalance {
        let mut row = AssetBalance::empty(owner, AssetSymbol::new(symbol).unwrap());
        row.available = Decimal::new(available, 0);
        row.version = 1;
        row
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        for cf in ALL_CFS {
            assert!(storage.cf_handle(cf).is_ok());
        }
    }

    #[test]
    fn test_commit_is_visible_and_drop_rolls_back() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let owner = BalanceOwner::Account(AccountId::new());
        let row = balance(owner, "USD", 100);
        let key = keys::balance_key(&owner, &row.asset);

        {
            let uow = storage.begin();
            uow.put(CF_BALANCES, &key, &row).unwrap();
            // dropped without commit
        }
        assert!(storage.get::<AssetBalance>(CF_BALANCES, &key).unwrap().is_none());

        let uow = storage.begin();
        uow.put(CF_BALANCES, &key, &row).unwrap();
        uow.commit().unwrap();

        let stored: AssetBalance = storage.get(CF_BALANCES, &key).unwrap().unwrap();
        assert_eq!(stored, row);
    }

    #[test]
    fn test_scan_prefix_stays_inside_owner() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let a = BalanceOwner::Account(AccountId::new());
        let b = BalanceOwner::Account(AccountId::new());

        let uow = storage.begin();
        for (owner, symbol) in [(a, "USD"), (a, "BTC"), (b, "USD")] {
            let row = balance(owner, symbol, 1);
            uow.put(CF_BALANCES, &keys::balance_key(&owner, &row.asset), &row)
                .unwrap();
        }
        uow.commit().unwrap();

        let rows: Vec<AssetBalance> = storage
            .scan_prefix(CF_BALANCES, &keys::owner_key(&a))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.owner == a));
        assert_eq!(storage.get_stats().unwrap().total_balances, 3);
    }

    #[test]
    fn test_pair_scan_sees_committed_rows_only() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let owner = BalanceOwner::Account(AccountId::new());

        let uow = storage.begin();
        let usd = balance(owner, "USD", 10);
        let btc = balance(owner, "BTC", 2);
        uow.put(CF_BALANCES, &keys::balance_key(&owner, &usd.asset), &usd)
            .unwrap();
        uow.put(CF_ACCOUNTS, b"row", &btc).unwrap();
        uow.commit().unwrap();

        let pending = storage.begin();
        let eth = balance(owner, "ETH", 5);
        pending
            .put(CF_BALANCES, &keys::balance_key(&owner, &eth.asset), &eth)
            .unwrap();

        let (balances, accounts): (Vec<AssetBalance>, Vec<AssetBalance>) =
            storage.scan_all_pair(CF_BALANCES, CF_ACCOUNTS).unwrap();
        assert_eq!(balances, vec![usd]);
        assert_eq!(accounts, vec![btc]);
        drop(pending);
    }

    #[test]
    fn test_reverse_scan_newest_first() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let owner = BalanceOwner::Account(AccountId::new());
        let other = BalanceOwner::Account(AccountId::new());

        let uow = storage.begin();
        let ids: Vec<_> = (0..3).map(|_| crate::types::EntryId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            uow.put_marker(CF_OWNER_ENTRIES, &keys::owner_entry_key(&owner, i as u64 + 1, id))
                .unwrap();
        }
        uow.put_marker(
            CF_OWNER_ENTRIES,
            &keys::owner_entry_key(&other, 99, &crate::types::EntryId::new()),
        )
        .unwrap();
        uow.commit().unwrap();

        let newest_first = storage
            .scan_prefix_keys_rev(CF_OWNER_ENTRIES, &keys::owner_key(&owner), 24, 10)
            .unwrap();
        let found: Vec<_> = newest_first
            .iter().filter_map(|k| keys::trailing_id(k)).collect();
        assert_eq!(
            found,
            vec![ids[2].as_uuid(), ids[1].as_uuid(), ids[0].as_uuid()]
        );

        let limited = storage
            .scan_prefix_keys_rev(CF_OWNER_ENTRIES, &keys::owner_key(&owner), 24, 1)
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
