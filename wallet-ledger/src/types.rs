//! Core types for the wallet ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money and asset amounts)
//! - Time-ordered identifiers (UUIDv7)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new time-ordered id
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Raw 16 bytes, used in storage keys
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// User identifier (owned by the identity service)
    UserId
);
id_type!(
    /// Account identifier; an account holds the cash balance
    AccountId
);
id_type!(
    /// Wallet identifier; a wallet holds lot-tracked positions
    WalletId
);
id_type!(
    /// Cost-basis lot identifier
    LotId
);
id_type!(
    /// Journal entry identifier
    EntryId
);
id_type!(
    /// Currency identifier in the external catalog
    CurrencyId
);

/// Upper-case asset ticker (`USD`, `BTC`, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetSymbol(String);

impl AssetSymbol {
    /// Longest symbol accepted; the length is stored in one key byte
    pub const MAX_LEN: usize = 32;

    /// Parse and normalize a symbol
    pub fn new(symbol: impl AsRef<str>) -> crate::Result<Self> {
        let trimmed = symbol.as_ref().trim();
        if trimmed.is_empty() {
            return Err(crate::Error::Validation("Asset symbol is empty".to_string()));
        }
        if trimmed.len() > Self::MAX_LEN {
            return Err(crate::Error::Validation(format!(
                "Asset symbol longer than {} characters",
                Self::MAX_LEN
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(crate::Error::Validation(format!(
                "Asset symbol {:?} contains invalid characters",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Holder of an asset balance row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BalanceOwner {
    /// Account-level balance (cash and directly adjusted assets)
    Account(AccountId),
    /// Wallet-level position backed by lots
    Wallet(WalletId),
}

impl fmt::Display for BalanceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceOwner::Account(id) => write!(f, "account:{}", id),
            BalanceOwner::Wallet(id) => write!(f, "wallet:{}", id),
        }
    }
}

/// Account availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Accepts all operations
    Active,
    /// Read-only until unfrozen
    Frozen,
    /// Permanently closed
    Closed,
}

/// Account owning cash balances and wallets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account id
    pub id: AccountId,
    /// Owning user
    pub user_id: UserId,
    /// Availability
    pub status: AccountStatus,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

/// Wallet grouping lot-tracked positions under an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet id
    pub id: WalletId,
    /// Owning account
    pub account_id: AccountId,
    /// Display name
    pub name: String,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Balance of one asset for one owner
///
/// `version` increases by one on every write and backs the optimistic
/// compare-and-swap path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// Holder of this balance
    pub owner: BalanceOwner,
    /// Asset
    pub asset: AssetSymbol,
    /// Spendable amount
    pub available: Decimal,
    /// Reserved amount
    pub locked: Decimal,
    /// Weighted average acquisition price, set for positions
    pub average_acquisition_price: Option<Decimal>,
    /// Concurrency version token
    pub version: u64,
    /// Last write timestamp
    pub updated_at: DateTime<Utc>,
}

impl AssetBalance {
    /// Empty balance row, not yet persisted (version 0)
    pub fn empty(owner: BalanceOwner, asset: AssetSymbol) -> Self {
        Self {
            owner,
            asset,
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            average_acquisition_price: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Available plus locked
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

/// One purchase batch used for cost-basis accounting
///
/// Only `remaining_amount` changes after creation, and it only decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionLot {
    /// Lot id
    pub id: LotId,
    /// Wallet holding the lot
    pub wallet_id: WalletId,
    /// Asset
    pub asset: AssetSymbol,
    /// Amount bought
    pub original_amount: Decimal,
    /// Amount not yet sold
    pub remaining_amount: Decimal,
    /// Price paid per unit
    pub unit_acquisition_price: Decimal,
    /// FIFO ordering key
    pub created_at: DateTime<Utc>,
    /// Set when `remaining_amount` reaches zero
    pub closed_at: Option<DateTime<Utc>>,
    /// Consolidated lot that absorbed this one's remainder
    pub merged_into: Option<LotId>,
}

impl PositionLot {
    /// Whether the lot can still be sold from
    pub fn is_open(&self) -> bool {
        self.remaining_amount > Decimal::ZERO
    }
}

/// Amount taken from one lot by a sell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotConsumption {
    /// Lot consumed
    pub lot_id: LotId,
    /// Amount taken
    pub amount: Decimal,
    /// Lot's unit acquisition price
    pub unit_acquisition_price: Decimal,
    /// Remaining amount after the sell
    pub remaining_after: Decimal,
}

/// Journal entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// Balance credit
    Deposit,
    /// Balance debit
    Withdrawal,
    /// Cash to asset purchase
    Buy,
    /// Asset to cash sale
    Sell,
    /// Outbound swap leg
    SwapOut,
    /// Inbound swap leg
    SwapIn,
    /// Available to locked
    Lock,
    /// Locked to available
    Unlock,
    /// Compensating entry for a cancelled one
    Reversal,
}

impl EntryType {
    /// Label used for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Deposit => "deposit",
            EntryType::Withdrawal => "withdrawal",
            EntryType::Buy => "buy",
            EntryType::Sell => "sell",
            EntryType::SwapOut => "swap_out",
            EntryType::SwapIn => "swap_in",
            EntryType::Lock => "lock",
            EntryType::Unlock => "unlock",
            EntryType::Reversal => "reversal",
        }
    }

    /// Whether a completed entry of this type may be compensated
    pub fn is_reversible(&self) -> bool {
        matches!(self, EntryType::Deposit | EntryType::Withdrawal)
    }
}

/// Journal entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Recorded, balances untouched
    Pending,
    /// Applied
    Completed,
    /// Abandoned before being applied
    Failed,
    /// Applied, then compensated by a reversal entry
    Cancelled,
}

impl EntryStatus {
    /// Allowed transitions
    ///
    /// ```text
    /// Pending -> Completed | Failed
    /// Completed -> Cancelled
    /// ```
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        matches!(
            (self, next),
            (EntryStatus::Pending, EntryStatus::Completed)
                | (EntryStatus::Pending, EntryStatus::Failed)
                | (EntryStatus::Completed, EntryStatus::Cancelled)
        )
    }

    /// Whether the entry's balance effects have been applied
    pub fn is_applied(&self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Cancelled)
    }
}

/// Signed change to one balance row, recorded on every entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEffect {
    /// Balance holder
    pub owner: BalanceOwner,
    /// Asset
    pub asset: AssetSymbol,
    /// Change to available
    pub available_delta: Decimal,
    /// Change to locked
    pub locked_delta: Decimal,
}

impl BalanceEffect {
    /// Effect on available only
    pub fn available(owner: BalanceOwner, asset: AssetSymbol, delta: Decimal) -> Self {
        Self {
            owner,
            asset,
            available_delta: delta,
            locked_delta: Decimal::ZERO,
        }
    }

    /// Opposite effect, used by compensating entries
    pub fn inverse(&self) -> Self {
        Self {
            owner: self.owner,
            asset: self.asset.clone(),
            available_delta: -self.available_delta,
            locked_delta: -self.locked_delta,
        }
    }
}

/// Fiat movement metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiatDetail {
    /// Payment provider
    pub provider: Option<String>,
    /// Payment method (card, pix, wire...)
    pub payment_method: Option<String>,
    /// Free-form payment info
    pub payment_info: Option<String>,
    /// Provider-side reference
    pub external_ref: Option<String>,
}

/// Crypto movement metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoDetail {
    /// Catalog id of the asset
    pub currency_id: CurrencyId,
    /// Asset
    pub symbol: AssetSymbol,
    /// Unit price applied
    pub exchange_rate: Decimal,
    /// Signed asset amount (negative when leaving the wallet)
    pub crypto_amount: Decimal,
    /// Realized profit or loss, for sells and outbound swap legs
    pub realized_pnl: Option<Decimal>,
    /// Lots created (buys) or consumed (sells)
    pub lots: Vec<LotConsumption>,
}

/// Type-specific extension row stored next to each entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryDetail {
    /// Deposit, withdrawal, lock and reversal entries
    Fiat(FiatDetail),
    /// Trade entries
    Crypto(CryptoDetail),
}

/// Immutable audit record of one balance-affecting operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id (UUIDv7)
    pub id: EntryId,
    /// Operation type
    pub entry_type: EntryType,
    /// Current status
    pub status: EntryStatus,
    /// Account the operation ran under
    pub account_id: AccountId,
    /// Wallet, for trade entries
    pub wallet_id: Option<WalletId>,
    /// Primary asset
    pub asset: AssetSymbol,
    /// Primary amount (cash for trades, asset amount otherwise); always positive
    pub amount: Decimal,
    /// Fee charged
    pub fee: Decimal,
    /// Idempotency reference
    pub reference: Option<String>,
    /// Linked entry (swap leg, reversed entry)
    pub related_entry_id: Option<EntryId>,
    /// Balance changes this entry applies once Completed
    pub effects: Vec<BalanceEffect>,
    /// Additional metadata
    pub metadata: BTreeMap<String, String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// SHA-256 over the immutable fields
    pub digest: [u8; 32],
}

/// Position row plus its lots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionView {
    /// Position balance row
    pub balance: AssetBalance,
    /// All lots, oldest first
    pub lots: Vec<PositionLot>,
}

/// Nanoseconds since the Unix epoch, clamped at zero
pub fn timestamp_nanos(ts: &DateTime<Utc>) -> u64 {
    ts.timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or(u64::MAX)
}

/// `a * b`, failing instead of panicking on overflow
pub fn checked_mul(a: Decimal, b: Decimal) -> crate::Result<Decimal> {
    a.checked_mul(b)
        .ok_or_else(|| crate::Error::Validation(format!("Amount overflow: {} * {}", a, b)))
}

/// `a / b`, failing on a zero divisor or overflow
pub fn checked_div(a: Decimal, b: Decimal) -> crate::Result<Decimal> {
    a.checked_div(b)
        .ok_or_else(|| crate::Error::Validation(format!("Invalid division: {} / {}", a, b)))
}

/// `a + b`, failing instead of panicking on overflow
pub fn checked_add(a: Decimal, b: Decimal) -> crate::Result<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| crate::Error::Validation(format!("Amount overflow: {} + {}", a, b)))
}
