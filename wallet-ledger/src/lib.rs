//! Wallet Ledger
//!
//! Account balances, lot-based position accounting and an append-only
//! transaction journal over one transactional RocksDB store.
//!
//! # Architecture
//!
//! - **Unit of work**: every mutation runs in one store transaction; balance
//!   rows, lots and journal entries commit together or not at all
//! - **Guarded updates**: debits check sufficiency under the row lock that
//!   mutates the row
//! - **Versioned positions**: average-price recomputation is written with a
//!   compare-and-swap on the row version and retried on conflict
//! - **Frozen pricing**: a priced operation fetches its price once, before
//!   the transaction opens
//!
//! # Invariants
//!
//! - No balance is ever negative
//! - A position equals the sum of its open lots' remaining amounts
//! - Every balance row equals the replay of its journal effects
//! - A reference id is consumed at most once per account

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accounts;
pub mod audit;
pub mod balances;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod journal;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod operations;
pub mod positions;
pub mod retry;
pub mod storage;
pub mod types;
pub mod unit_of_work;

// Re-exports
pub use audit::{AuditReport, AuditViolation};
pub use catalog::{CatalogItem, CurrencyCatalog, HttpCatalog, StaticCatalog};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use ledger::WalletLedger;
pub use operations::{
    AdjustReceipt, AdjustRequest, BuyReceipt, BuyRequest, OperationResult, SellReceipt,
    SellRequest, SwapReceipt, SwapRequest,
};
pub use types::{
    Account, AccountId, AccountStatus, AssetBalance, AssetSymbol, BalanceOwner, CurrencyId,
    EntryId, EntryStatus, EntryType, LedgerEntry, LotId, PositionLot, UserId, Wallet, WalletId,
};
