//! Unit of work over one RocksDB transaction
//!
//! Every mutating operation runs inside a single `UnitOfWork`. Reads through
//! it see the transaction's own writes; `get_for_update` takes an exclusive
//! row lock that is held until commit or rollback. Dropping a unit of work
//! without committing rolls it back, so `?` anywhere in an operation leaves
//! the store untouched.

use crate::{error::Result, storage::Storage, types::EntryType};
use rocksdb::{
    Direction, IteratorMode, Transaction, TransactionDB, TransactionOptions, WriteOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use std::cell::RefCell;

/// Store transaction plus typed helpers
pub struct UnitOfWork<'a> {
    storage: &'a Storage,
    txn: Transaction<'a, TransactionDB>,
    journaled: RefCell<Vec<EntryType>>,
}

impl std::fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork").finish_non_exhaustive()
    }
}

impl<'a> UnitOfWork<'a> {
    pub(crate) fn new(storage: &'a Storage) -> Self {
        let write_opts = WriteOptions::default();
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_deadlock_detect(true);
        txn_opts.set_lock_timeout(storage.lock_timeout_ms());

        let txn = storage.db().transaction_opt(&write_opts, &txn_opts);
        Self {
            storage,
            txn,
            journaled: RefCell::new(Vec::new()),
        }
    }

    /// Read a row without locking it
    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.storage.cf_handle(cf)?;
        decode(self.txn.get_cf(handle, key)?)
    }

    /// Read a row and hold an exclusive lock on it until the unit of work ends
    ///
    /// Also locks keys that do not exist yet, which serializes concurrent
    /// first inserts of the same row.
    pub fn get_for_update<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.storage.cf_handle(cf)?;
        decode(self.txn.get_for_update_cf(handle, key, true)?)
    }

    /// Read a row under a shared lock; blocks while a writer holds it
    pub fn get_shared<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.storage.cf_handle(cf)?;
        decode(self.txn.get_for_update_cf(handle, key, false)?)
    }

    /// Write a row
    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let handle = self.storage.cf_handle(cf)?;
        let bytes = bincode::serialize(value)?;
        self.txn.put_cf(handle, key, bytes)?;
        Ok(())
    }

    /// Write an index row with an empty value
    pub fn put_marker(&self, cf: &str, key: &[u8]) -> Result<()> {
        let handle = self.storage.cf_handle(cf)?;
        self.txn.put_cf(handle, key, b"")?;
        Ok(())
    }

    /// Delete a row
    pub fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        let handle = self.storage.cf_handle(cf)?;
        self.txn.delete_cf(handle, key)?;
        Ok(())
    }

    /// Index keys under a prefix in key order, including this transaction's writes
    pub fn prefix_keys(&self, cf: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let handle = self.storage.cf_handle(cf)?;
        let iter = self
            .txn
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

    /// Note a journal entry written in this unit of work
    pub(crate) fn note_entry(&self, entry_type: EntryType) {
        self.journaled.borrow_mut().push(entry_type);
    }

    /// Entry types journaled so far
    pub fn journaled(&self) -> Vec<EntryType> {
        self.journaled.borrow().clone()
    }

    /// Commit every write atomically and release locks
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    /// Discard every write and release locks
    pub fn rollback(self) -> Result<()> {
        self.txn.rollback()?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(bytes: Option<Vec<u8>>) -> Result<Option<T>> {
    match bytes {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Storage, CF_BALANCES};
    use crate::{Config, Error};
    use tempfile::TempDir;

    fn open() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.lock_timeout_ms = 50;
        (Storage::open(&config).unwrap(), temp_dir)
    }

    #[test]
    fn test_reads_see_own_writes() {
        let (storage, _temp) = open();
        let uow = storage.begin();
        uow.put(CF_BALANCES, b"k1", &7u64).unwrap();
        assert_eq!(uow.get::<u64>(CF_BALANCES, b"k1").unwrap(), Some(7));
        assert_eq!(uow.prefix_keys(CF_BALANCES, b"k").unwrap().len(), 1);
        uow.rollback().unwrap();
        assert!(storage.get::<u64>(CF_BALANCES, b"k1").unwrap().is_none());
    }

    #[test]
    fn test_second_locker_times_out_as_conflict() {
        let (storage, _temp) = open();
        let first = storage.begin();
        first.get_for_update::<u64>(CF_BALANCES, b"row").unwrap();

        let second = storage.begin();
        let err = second.get_for_update::<u64>(CF_BALANCES, b"row").unwrap_err();
        assert!(matches!(err, Error::ConcurrencyConflict(_)), "got {err:?}");

        first.commit().unwrap();
        let third = storage.begin();
        assert!(third.get_for_update::<u64>(CF_BALANCES, b"row").is_ok());
    }
}
