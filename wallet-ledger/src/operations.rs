//! Request and result types exposed to callers

use crate::{
    error::{Error, ErrorKind},
    types::{
        AccountId, AssetBalance, CurrencyId, EntryId, FiatDetail, LedgerEntry, LotConsumption,
        LotId, WalletId,
    },
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a coordinated operation
///
/// Business-rule failures are reported here instead of as `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult<T> {
    /// Whether the operation committed
    pub is_success: bool,
    /// Failure message
    pub error: Option<String>,
    /// Failure category
    pub error_kind: Option<ErrorKind>,
    /// Request correlation id
    pub correlation_id: Uuid,
    /// Operation-specific data
    pub data: Option<T>,
}

impl<T> OperationResult<T> {
    /// Committed operation
    pub fn success(correlation_id: Uuid, data: T) -> Self {
        Self {
            is_success: true,
            error: None,
            error_kind: None,
            correlation_id,
            data: Some(data),
        }
    }

    /// Rejected operation
    pub fn failure(correlation_id: Uuid, error: &Error) -> Self {
        Self {
            is_success: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            correlation_id,
            data: None,
        }
    }

    /// Borrow the data of a successful result
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }
}

/// Data returned by a committed operation
pub trait Receipt {
    /// Whether the operation was answered from an earlier entry
    fn replayed(&self) -> bool {
        false
    }
}

/// Buy an asset with quote-asset cash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyRequest {
    /// Account holding the cash
    pub account_id: AccountId,
    /// Wallet receiving the position
    pub wallet_id: WalletId,
    /// Catalog id of the asset bought
    pub currency_id: CurrencyId,
    /// Cash spent, fee included
    pub fiat_amount: Decimal,
    /// Fee withheld from the cash spent
    pub fee: Decimal,
    /// Open a separate lot instead of consolidating the open ones
    pub create_new_lot: bool,
    /// Idempotency reference
    pub reference: Option<String>,
}

/// Sell an asset for quote-asset cash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellRequest {
    /// Account receiving the cash
    pub account_id: AccountId,
    /// Wallet holding the position
    pub wallet_id: WalletId,
    /// Catalog id of the asset sold
    pub currency_id: CurrencyId,
    /// Asset amount sold
    pub amount: Decimal,
    /// Fee withheld from the proceeds
    pub fee: Decimal,
    /// Lot to sell from
    pub lot_id: Option<LotId>,
    /// Amount to take from `lot_id`; the rest is taken oldest lot first
    pub lot_amount: Option<Decimal>,
    /// Idempotency reference
    pub reference: Option<String>,
}

/// Exchange one asset for another inside a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    /// Owning account
    pub account_id: AccountId,
    /// Wallet holding both positions
    pub wallet_id: WalletId,
    /// Asset given up
    pub currency_out_id: CurrencyId,
    /// Asset received
    pub currency_in_id: CurrencyId,
    /// Amount of the outgoing asset
    pub amount_out: Decimal,
    /// Fee in quote-asset value, withheld before conversion
    pub fee: Decimal,
    /// Idempotency reference
    pub reference: Option<String>,
}

/// Credit or debit an account balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustRequest {
    /// Account holding the balance
    pub account_id: AccountId,
    /// Asset symbol
    pub asset: String,
    /// Signed change; positive credits, negative debits
    pub delta: Decimal,
    /// Idempotency reference
    pub reference: Option<String>,
    /// Payment metadata
    pub detail: FiatDetail,
}

impl AdjustRequest {
    /// Adjustment without reference or payment metadata
    pub fn new(account_id: AccountId, asset: impl Into<String>, delta: Decimal) -> Self {
        Self {
            account_id,
            asset: asset.into(),
            delta,
            reference: None,
            detail: FiatDetail::default(),
        }
    }

    /// Set idempotency reference
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Committed buy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyReceipt {
    /// Journal entry
    pub entry_id: EntryId,
    /// Lot that received the purchase
    pub lot_id: LotId,
    /// Asset amount bought
    pub purchased_amount: Decimal,
    /// Price applied
    pub unit_price: Decimal,
    /// Cash debited
    pub fiat_amount: Decimal,
    /// Fee withheld
    pub fee: Decimal,
    /// Cash balance after the buy
    pub cash: AssetBalance,
    /// Position after the buy
    pub position: AssetBalance,
    /// Answered from an earlier entry
    pub replayed: bool,
}

impl Receipt for BuyReceipt {
    fn replayed(&self) -> bool {
        self.replayed
    }
}

/// Committed sell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellReceipt {
    /// Journal entry
    pub entry_id: EntryId,
    /// Asset amount sold
    pub sold_amount: Decimal,
    /// Price applied
    pub unit_price: Decimal,
    /// Sold amount times price
    pub gross: Decimal,
    /// Fee withheld
    pub fee: Decimal,
    /// Cash credited
    pub proceeds: Decimal,
    /// Gain or loss against the consumed lots
    pub realized_pnl: Decimal,
    /// Lots consumed, in consumption order
    pub consumed: Vec<LotConsumption>,
    /// Cash balance after the sell
    pub cash: AssetBalance,
    /// Position after the sell
    pub position: AssetBalance,
    /// Answered from an earlier entry
    pub replayed: bool,
}

impl Receipt for SellReceipt {
    fn replayed(&self) -> bool {
        self.replayed
    }
}

/// Committed swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapReceipt {
    /// Outbound leg entry
    pub out_entry_id: EntryId,
    /// Inbound leg entry
    pub in_entry_id: EntryId,
    /// Amount given up
    pub amount_out: Decimal,
    /// Amount received
    pub amount_in: Decimal,
    /// Price of the outgoing asset
    pub price_out: Decimal,
    /// Price of the incoming asset
    pub price_in: Decimal,
    /// Quote-asset value of the outgoing amount
    pub fiat_value: Decimal,
    /// Fee withheld
    pub fee: Decimal,
    /// Gain or loss against the consumed lots
    pub realized_pnl: Decimal,
    /// Lots consumed from the outgoing position
    pub consumed: Vec<LotConsumption>,
    /// Lot created in the incoming position
    pub lot_id: LotId,
    /// Outgoing position after the swap
    pub position_out: AssetBalance,
    /// Incoming position after the swap
    pub position_in: AssetBalance,
    /// Answered from an earlier entry
    pub replayed: bool,
}

impl Receipt for SwapReceipt {
    fn replayed(&self) -> bool {
        self.replayed
    }
}

/// Committed balance adjustment, lock, unlock, settlement or reversal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustReceipt {
    /// Journal entry written (or found, when replayed)
    pub entry_id: EntryId,
    /// Balance after the operation
    pub balance: AssetBalance,
    /// Answered from an earlier entry
    pub replayed: bool,
}

impl Receipt for AdjustReceipt {
    fn replayed(&self) -> bool {
        self.replayed
    }
}

impl Receipt for LedgerEntry {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_carries_kind() {
        let err = Error::InsufficientFunds {
            required: Decimal::new(150, 0),
            available: Decimal::new(100, 0),
        };
        let result: OperationResult<AdjustReceipt> = OperationResult::failure(Uuid::now_v7(), &err);
        assert!(!result.is_success);
        assert_eq!(result.error_kind, Some(ErrorKind::InsufficientFunds));
        assert!(result.error.unwrap().contains("150"));
        assert!(result.data.is_none());
    }

    #[test]
    fn test_result_serializes_as_json() {
        let result = OperationResult::success(Uuid::now_v7(), 7u32);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["is_success"], true);
        assert_eq!(json["data"], 7);
    }
}
