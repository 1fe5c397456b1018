//! Main ledger interface
//!
//! Owns the store and wires the account ledger, position tracker, journal
//! and coordinator together. Every mutation runs in its own unit of work.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_decimal::Decimal;
//! use wallet_ledger::{catalog::StaticCatalog, AdjustRequest, Config, WalletLedger};
//!
//! #[tokio::main]
//! async fn main() -> wallet_ledger::Result<()> {
//!     let catalog = Arc::new(StaticCatalog::new());
//!     let ledger = WalletLedger::open(Config::default(), catalog)?;
//!
//!     let account = ledger.open_account(wallet_ledger::UserId::new())?;
//!     let result = ledger
//!         .adjust_balance(AdjustRequest::new(account.id, "USD", Decimal::new(100, 0)))
//!         .await?;
//!     assert!(result.is_success);
//!     Ok(())
//! }
//! ```

use crate::{
    audit::{AuditReport, AuditViolation, Auditor},
    catalog::CurrencyCatalog,
    coordinator::OperationCoordinator,
    journal::JournalRecord,
    metrics::Metrics,
    operations::{
        AdjustReceipt, AdjustRequest, BuyReceipt, BuyRequest, OperationResult, SellReceipt,
        SellRequest, SwapReceipt, SwapRequest,
    },
    storage::{Storage, StorageStats},
    types::{
        Account, AccountId, AccountStatus, AssetBalance, AssetSymbol, BalanceOwner, EntryId,
        FiatDetail, LedgerEntry, PositionLot, PositionView, UserId, Wallet, WalletId,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// Wallet ledger
pub struct WalletLedger {
    /// Shared store
    storage: Arc<Storage>,

    /// Runs every mutation
    coordinator: OperationCoordinator,

    /// Reconciliation
    auditor: Auditor,

    /// Metrics registry
    metrics: Arc<Metrics>,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for WalletLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletLedger")
            .field("data_dir", &self.config.data_dir)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl WalletLedger {
    /// Open ledger with configuration and a price source
    pub fn open(config: Config, catalog: Arc<dyn CurrencyCatalog>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Arc::new(
            Metrics::new()
                .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?,
        );
        let coordinator =
            OperationCoordinator::new(storage.clone(), catalog, metrics.clone(), &config)?;
        let auditor = Auditor::new(storage.clone(), coordinator.journal().clone());

        info!(
            service = %config.service_name,
            data_dir = ?config.data_dir,
            quote_asset = %config.quote_asset,
            "Wallet ledger opened"
        );

        Ok(Self {
            storage,
            coordinator,
            auditor,
            metrics,
            config,
        })
    }

    // Accounts and wallets

    /// Open an active account for a user
    pub fn open_account(&self, user_id: UserId) -> Result<Account> {
        self.coordinator.in_unit("open_account", |uow| {
            self.coordinator.registry().open_account(uow, user_id)
        })
    }

    /// Open a wallet under an active account
    pub fn open_wallet(&self, account_id: AccountId, name: &str) -> Result<Wallet> {
        self.coordinator.in_unit("open_wallet", |uow| {
            self.coordinator.registry().open_wallet(uow, account_id, name)
        })
    }

    /// Activate, freeze or close an account
    pub fn set_account_status(&self, account_id: AccountId, status: AccountStatus) -> Result<Account> {
        self.coordinator.in_unit("set_account_status", |uow| {
            self.coordinator.registry().set_status(uow, account_id, status)
        })
    }

    /// Get account by id
    pub fn account(&self, account_id: AccountId) -> Result<Option<Account>> {
        self.coordinator.registry().account(account_id)
    }

    /// Get wallet by id
    pub fn wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>> {
        self.coordinator.registry().wallet(wallet_id)
    }

    // Priced operations

    /// Buy an asset with cash
    pub async fn buy(&self, request: BuyRequest) -> Result<OperationResult<BuyReceipt>> {
        self.coordinator.buy(request).await
    }

    /// Sell an asset for cash
    pub async fn sell(&self, request: SellRequest) -> Result<OperationResult<SellReceipt>> {
        self.coordinator.sell(request).await
    }

    /// Exchange one asset for another in a wallet
    pub async fn swap(&self, request: SwapRequest) -> Result<OperationResult<SwapReceipt>> {
        self.coordinator.swap(request).await
    }

    // Balance operations

    /// Credit or debit an account balance
    pub async fn adjust_balance(
        &self,
        request: AdjustRequest,
    ) -> Result<OperationResult<AdjustReceipt>> {
        self.coordinator
            .run_unpriced("adjust_balance", |uow| {
                let asset = AssetSymbol::new(&request.asset)?;
                self.coordinator.ledger().adjust_balance(
                    uow,
                    request.account_id,
                    &asset,
                    request.delta,
                    request.reference.as_deref(),
                    request.detail.clone(),
                )
            })
            .await
    }

    /// Credit or debit the balance of a user's oldest active account
    ///
    /// Returns whether the adjustment was applied. Business failures,
    /// including a user with no active account, come back as `false`;
    /// store faults are still errors.
    pub async fn adjust_user_balance(
        &self,
        user_id: UserId,
        asset: &str,
        delta: Decimal,
    ) -> Result<bool> {
        let account = match self.coordinator.registry().active_account_for_user(user_id) {
            Ok(account) => account,
            Err(err) if err.is_business() => {
                warn!(user_id = %user_id, error = %err, "No account to adjust");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let result = self
            .adjust_balance(AdjustRequest::new(account.id, asset, delta))
            .await?;
        Ok(result.is_success)
    }

    /// Reserve available funds
    pub async fn lock_funds(
        &self,
        account_id: AccountId,
        asset: &AssetSymbol,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<OperationResult<AdjustReceipt>> {
        self.coordinator
            .run_unpriced("lock_funds", |uow| {
                self.coordinator
                    .ledger()
                    .lock_funds(uow, account_id, asset, amount, reference)
            })
            .await
    }

    /// Release reserved funds
    pub async fn unlock_funds(
        &self,
        account_id: AccountId,
        asset: &AssetSymbol,
        amount: Decimal,
        reference: Option<&str>,
    ) -> Result<OperationResult<AdjustReceipt>> {
        self.coordinator
            .run_unpriced("unlock_funds", |uow| {
                self.coordinator
                    .ledger()
                    .unlock_funds(uow, account_id, asset, amount, reference)
            })
            .await
    }

    /// Journal a deposit awaiting confirmation
    pub async fn record_pending_deposit(
        &self,
        account_id: AccountId,
        asset: &AssetSymbol,
        amount: Decimal,
        reference: Option<&str>,
        detail: FiatDetail,
    ) -> Result<OperationResult<LedgerEntry>> {
        self.coordinator
            .run_unpriced("record_pending_deposit", |uow| {
                self.coordinator.ledger().record_pending_deposit(
                    uow,
                    account_id,
                    asset,
                    amount,
                    reference,
                    detail.clone(),
                )
            })
            .await
    }

    /// Confirm a pending deposit and credit it
    pub async fn settle_pending(&self, entry_id: EntryId) -> Result<OperationResult<AdjustReceipt>> {
        self.coordinator
            .run_unpriced("settle_pending", |uow| {
                self.coordinator.ledger().settle_pending(uow, entry_id)
            })
            .await
    }

    /// Mark a pending deposit failed
    pub async fn fail_pending(&self, entry_id: EntryId) -> Result<OperationResult<LedgerEntry>> {
        self.coordinator
            .run_unpriced("fail_pending", |uow| {
                self.coordinator.ledger().fail_pending(uow, entry_id)
            })
            .await
    }

    /// Compensate a completed deposit or withdrawal
    pub async fn reverse_entry(
        &self,
        entry_id: EntryId,
        reason: &str,
    ) -> Result<OperationResult<AdjustReceipt>> {
        self.coordinator
            .run_unpriced("reverse_entry", |uow| {
                self.coordinator.ledger().reverse_entry(uow, entry_id, reason)
            })
            .await
    }

    // Queries

    /// Balance row, if one was ever written
    pub fn balance(&self, owner: BalanceOwner, asset: &AssetSymbol) -> Result<Option<AssetBalance>> {
        self.coordinator.ledger().balance(owner, asset)
    }

    /// Every balance row of an owner
    pub fn balances(&self, owner: BalanceOwner) -> Result<Vec<AssetBalance>> {
        self.coordinator.ledger().balances(owner)
    }

    /// Position row and full lot history
    pub fn position(&self, wallet_id: WalletId, asset: &AssetSymbol) -> Result<PositionView> {
        self.coordinator.tracker().position(wallet_id, asset)
    }

    /// Every lot of a position, oldest first
    pub fn lots(&self, wallet_id: WalletId, asset: &AssetSymbol) -> Result<Vec<PositionLot>> {
        self.coordinator.tracker().lots(wallet_id, asset)
    }

    /// Lots still holding an amount, oldest first
    pub fn open_lots(&self, wallet_id: WalletId, asset: &AssetSymbol) -> Result<Vec<PositionLot>> {
        self.coordinator.tracker().open_lots(wallet_id, asset)
    }

    /// Entry plus its extension row
    pub fn entry(&self, entry_id: EntryId) -> Result<Option<JournalRecord>> {
        self.coordinator.journal().record(entry_id)
    }

    /// Latest entries touching an owner, newest first
    pub fn entries(&self, owner: &BalanceOwner, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.coordinator.journal().entries(owner, limit)
    }

    /// Entries touching an owner created in `[from, to)`, newest first
    pub fn entries_between(
        &self,
        owner: &BalanceOwner,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        self.coordinator.journal().entries_between(owner, from, to)
    }

    // Audit

    /// Reconcile the whole store
    pub fn audit(&self) -> Result<AuditReport> {
        self.auditor.audit_all()
    }

    /// Compare one position with its open lots
    pub fn audit_position(
        &self,
        wallet_id: WalletId,
        asset: &AssetSymbol,
    ) -> Result<Vec<AuditViolation>> {
        self.auditor.audit_position(wallet_id, asset)
    }

    /// Replay the journal for one balance row
    pub fn reconstruct_balance(
        &self,
        owner: BalanceOwner,
        asset: &AssetSymbol,
    ) -> Result<(Decimal, Decimal)> {
        self.auditor.reconstruct_balance(owner, asset)
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Metrics registry
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::ErrorKind;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn open() -> (WalletLedger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let ledger = WalletLedger::open(config, Arc::new(StaticCatalog::new())).unwrap();
        (ledger, temp_dir)
    }

    #[tokio::test]
    async fn test_open_ledger() {
        let (ledger, _temp) = open();
        let stats = ledger.stats().unwrap();
        assert_eq!(stats.total_entries, 0);
        assert!(ledger.audit().unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_adjust_balance_rejects_bad_symbol() {
        let (ledger, _temp) = open();
        let account = ledger.open_account(UserId::new()).unwrap();

        let result = ledger
            .adjust_balance(AdjustRequest::new(account.id, "  ", dec!(10)))
            .await
            .unwrap();
        assert!(!result.is_success);
        assert_eq!(result.error_kind, Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_adjust_user_balance() {
        let (ledger, _temp) = open();
        let user_id = UserId::new();
        let account = ledger.open_account(user_id).unwrap();
        let usd = AssetSymbol::new("USD").unwrap();

        assert!(ledger.adjust_user_balance(user_id, "USD", dec!(100)).await.unwrap());
        assert!(!ledger.adjust_user_balance(user_id, "USD", dec!(-150)).await.unwrap());
        assert!(!ledger
            .adjust_user_balance(UserId::new(), "USD", dec!(10))
            .await
            .unwrap());

        let balance = ledger
            .balance(BalanceOwner::Account(account.id), &usd)
            .unwrap()
            .unwrap();
        assert_eq!(balance.available, dec!(100));
    }

    #[tokio::test]
    async fn test_frozen_account_cannot_open_wallet() {
        let (ledger, _temp) = open();
        let account = ledger.open_account(UserId::new()).unwrap();
        ledger
            .set_account_status(account.id, AccountStatus::Frozen)
            .unwrap();

        let err = ledger.open_wallet(account.id, "main").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
