//! Account and wallet registry
//!
//! Accounts hold cash balances; wallets hold lot-tracked positions and
//! belong to exactly one account. Every balance mutation checks that the
//! account exists and is active, and that the wallet belongs to it.

use crate::{
    keys,
    storage::{Storage, CF_ACCOUNTS, CF_USER_ACCOUNTS, CF_WALLETS},
    types::{Account, AccountId, AccountStatus, UserId, Wallet, WalletId},
    unit_of_work::UnitOfWork,
    Error, Result,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Account and wallet lookups and lifecycle
#[derive(Debug, Clone)]
pub struct AccountRegistry {
    storage: Arc<Storage>,
}

impl AccountRegistry {
    /// Create registry over storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Open a new active account for a user
    pub fn open_account(&self, uow: &UnitOfWork<'_>, user_id: UserId) -> Result<Account> {
        let now = Utc::now();
        let account = Account {
            id: AccountId::new(),
            user_id,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        };
        uow.put(CF_ACCOUNTS, account.id.as_bytes(), &account)?;
        uow.put_marker(CF_USER_ACCOUNTS, &keys::user_account_key(&user_id, &account.id))?;

        info!(account_id = %account.id, user_id = %user_id, "Account opened");
        Ok(account)
    }

    /// Open a wallet under an active account
    pub fn open_wallet(
        &self,
        uow: &UnitOfWork<'_>,
        account_id: AccountId,
        name: &str,
    ) -> Result<Wallet> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Wallet name is empty".to_string()));
        }
        require_active(uow, account_id)?;

        let wallet = Wallet {
            id: WalletId::new(),
            account_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        uow.put(CF_WALLETS, wallet.id.as_bytes(), &wallet)?;

        info!(wallet_id = %wallet.id, account_id = %account_id, "Wallet opened");
        Ok(wallet)
    }

    /// Change account status
    ///
    /// Closed accounts cannot be reopened.
    pub fn set_status(
        &self,
        uow: &UnitOfWork<'_>,
        account_id: AccountId,
        status: AccountStatus,
    ) -> Result<Account> {
        let mut account: Account = uow
            .get_for_update(CF_ACCOUNTS, account_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("Account {}", account_id)))?;

        if account.status == AccountStatus::Closed && status != AccountStatus::Closed {
            return Err(Error::Validation(format!(
                "Account {} is closed",
                account_id
            )));
        }

        account.status = status;
        account.updated_at = Utc::now();
        uow.put(CF_ACCOUNTS, account_id.as_bytes(), &account)?;

        info!(account_id = %account_id, status = ?status, "Account status changed");
        Ok(account)
    }

    /// Get account by id
    pub fn account(&self, account_id: AccountId) -> Result<Option<Account>> {
        self.storage.get(CF_ACCOUNTS, account_id.as_bytes())
    }

    /// Oldest active account of a user
    pub fn active_account_for_user(&self, user_id: UserId) -> Result<Account> {
        let index = self
            .storage
            .scan_prefix_keys(CF_USER_ACCOUNTS, user_id.as_bytes())?;
        for key in &index {
            let account_id = keys::trailing_id(key)
                .map(AccountId::from_uuid)
                .ok_or_else(|| Error::InvariantViolation("Malformed user index key".to_string()))?;
            let account = self.account(account_id)?.ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "User index points at missing account {}",
                    account_id
                ))
            })?;
            if account.status == AccountStatus::Active {
                return Ok(account);
            }
        }
        Err(Error::NotFound(format!("Active account for user {}", user_id)))
    }

    /// Get wallet by id
    pub fn wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>> {
        self.storage.get(CF_WALLETS, wallet_id.as_bytes())
    }

    /// Committed-state check used before pricing
    pub fn check_wallet(&self, account_id: AccountId, wallet_id: WalletId) -> Result<()> {
        let account = self
            .account(account_id)?
            .ok_or_else(|| Error::NotFound(format!("Account {}", account_id)))?;
        ensure_active(&account)?;

        let wallet = self
            .wallet(wallet_id)?
            .ok_or_else(|| Error::NotFound(format!("Wallet {}", wallet_id)))?;
        ensure_owned(&wallet, account_id)
    }
}

/// Load an account inside a unit of work and require it to be active
pub(crate) fn require_active(uow: &UnitOfWork<'_>, account_id: AccountId) -> Result<Account> {
    let account: Account = uow
        .get(CF_ACCOUNTS, account_id.as_bytes())?
        .ok_or_else(|| Error::NotFound(format!("Account {}", account_id)))?;
    ensure_active(&account)?;
    Ok(account)
}

/// Load a wallet inside a unit of work and require it to belong to the account
pub(crate) fn require_wallet(
    uow: &UnitOfWork<'_>,
    account_id: AccountId,
    wallet_id: WalletId,
) -> Result<Wallet> {
    let wallet: Wallet = uow
        .get(CF_WALLETS, wallet_id.as_bytes())?
        .ok_or_else(|| Error::NotFound(format!("Wallet {}", wallet_id)))?;
    ensure_owned(&wallet, account_id)?;
    Ok(wallet)
}

fn ensure_active(account: &Account) -> Result<()> {
    if account.status != AccountStatus::Active {
        return Err(Error::Validation(format!(
            "Account {} is {:?}",
            account.id, account.status
        )));
    }
    Ok(())
}

fn ensure_owned(wallet: &Wallet, account_id: AccountId) -> Result<()> {
    if wallet.account_id != account_id {
        return Err(Error::Validation(format!(
            "Wallet {} does not belong to account {}",
            wallet.id, account_id
        )));
    }
    Ok(())
}
