//! Property-based tests for ledger invariants
//!
//! - Non-negativity: no sequence of adjustments overdraws a balance
//! - Lot sum: a position always equals the sum of its open lots
//! - Idempotence: replaying a reference never moves a balance twice
//! - Reconstruction: every balance row equals its journal replay

use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;
use wallet_ledger::{
    catalog::StaticCatalog, AccountId, AdjustRequest, AssetSymbol, BalanceOwner, BuyRequest,
    Config, CurrencyId, SellRequest, UserId, WalletId, WalletLedger,
};

/// Strategy for signed cash movements in cents
fn delta_strategy() -> impl Strategy<Value = Decimal> {
    (-50_000i64..50_000i64)
        .prop_filter("non-zero", |cents| *cents != 0)
        .prop_map(|cents| Decimal::new(cents, 2))
}

/// Buy (fiat cents, fee cents) or sell (asset satoshis, fee cents)
#[derive(Debug, Clone)]
enum Trade {
    Buy(i64, i64),
    Sell(i64, i64),
}

fn trade_strategy() -> impl Strategy<Value = Trade> {
    prop_oneof![
        (100i64..50_000i64, 0i64..100i64).prop_map(|(cents, fee)| Trade::Buy(cents, fee)),
        (1i64..2_000_000i64, 0i64..2_000i64).prop_map(|(sats, fee)| Trade::Sell(sats, fee)),
    ]
}

struct TestLedger {
    ledger: WalletLedger,
    account_id: AccountId,
    wallet_id: WalletId,
    btc: CurrencyId,
    catalog: Arc<StaticCatalog>,
    _temp: TempDir,
}

fn create_test_ledger() -> TestLedger {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    let catalog = Arc::new(StaticCatalog::new());
    let btc = catalog.insert("BTC", Decimal::new(50_000, 0)).unwrap();
    let ledger = WalletLedger::open(config, catalog.clone()).unwrap();
    let account = ledger.open_account(UserId::new()).unwrap();
    let wallet = ledger.open_wallet(account.id, "main").unwrap();

    TestLedger {
        ledger,
        account_id: account.id,
        wallet_id: wallet.id,
        btc,
        catalog,
        _temp: temp_dir,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: a balance follows the accepted adjustments and never goes negative
    #[test]
    fn prop_balance_never_negative(deltas in prop::collection::vec(delta_strategy(), 1..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let t = create_test_ledger();
            let usd = AssetSymbol::new("USD").unwrap();
            let mut expected = Decimal::ZERO;

            for delta in deltas {
                let result = t
                    .ledger
                    .adjust_balance(AdjustRequest::new(t.account_id, "USD", delta))
                    .await
                    .unwrap();
                if expected + delta >= Decimal::ZERO {
                    prop_assert!(result.is_success);
                    expected += delta;
                } else {
                    prop_assert!(!result.is_success);
                }
            }

            let stored = t
                .ledger
                .balance(BalanceOwner::Account(t.account_id), &usd)
                .unwrap()
                .map(|b| b.available)
                .unwrap_or_default();
            prop_assert_eq!(stored, expected);
            prop_assert!(t.ledger.audit().unwrap().is_clean());
            Ok(())
        })?;
    }

    /// Property: position equals the sum of open lots after any trade sequence
    #[test]
    fn prop_lot_sum_matches_position(
        trades in prop::collection::vec(trade_strategy(), 1..20),
        prices in prop::collection::vec(20_000i64..80_000i64, 20),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let t = create_test_ledger();
            t.ledger
                .adjust_balance(AdjustRequest::new(t.account_id, "USD", Decimal::new(1_000_000, 0)))
                .await
                .unwrap();
            let btc = AssetSymbol::new("BTC").unwrap();
            let usd = AssetSymbol::new("USD").unwrap();

            for (trade, price) in trades.into_iter().zip(prices) {
                t.catalog.set_price(t.btc, Decimal::new(price, 0)).unwrap();
                match trade {
                    Trade::Buy(cents, fee) => {
                        t.ledger
                            .buy(BuyRequest {
                                account_id: t.account_id,
                                wallet_id: t.wallet_id,
                                currency_id: t.btc,
                                fiat_amount: Decimal::new(cents, 2),
                                fee: Decimal::new(fee, 2),
                                create_new_lot: cents % 3 != 0,
                                reference: None,
                            })
                            .await
                            .unwrap();
                    }
                    Trade::Sell(sats, fee) => {
                        t.ledger
                            .sell(SellRequest {
                                account_id: t.account_id,
                                wallet_id: t.wallet_id,
                                currency_id: t.btc,
                                amount: Decimal::new(sats, 8),
                                fee: Decimal::new(fee, 2),
                                lot_id: None,
                                lot_amount: None,
                                reference: None,
                            })
                            .await
                            .unwrap();
                    }
                }

                let position = t.ledger.position(t.wallet_id, &btc).unwrap();
                let open: Decimal = t
                    .ledger
                    .open_lots(t.wallet_id, &btc)
                    .unwrap()
                    .iter()
                    .map(|lot| lot.remaining_amount)
                    .sum();
                prop_assert_eq!(position.balance.available, open);
                prop_assert!(position.balance.available >= Decimal::ZERO);
                let cash = t
                    .ledger
                    .balance(BalanceOwner::Account(t.account_id), &usd)
                    .unwrap()
                    .map(|b| b.available)
                    .unwrap_or_default();
                prop_assert!(cash >= Decimal::ZERO);
            }

            prop_assert!(t.ledger.audit().unwrap().is_clean());
            Ok(())
        })?;
    }

    /// Property: a reference applies its adjustment once however often it is sent
    #[test]
    fn prop_reference_applied_once(cents in 1i64..1_000_000i64, repeats in 2usize..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let t = create_test_ledger();
            let usd = AssetSymbol::new("USD").unwrap();
            let amount = Decimal::new(cents, 2);

            let mut entry_ids = Vec::new();
            for _ in 0..repeats {
                let result = t
                    .ledger
                    .adjust_balance(
                        AdjustRequest::new(t.account_id, "USD", amount).with_reference("deposit-1"),
                    )
                    .await
                    .unwrap();
                prop_assert!(result.is_success);
                entry_ids.push(result.data.unwrap().entry_id);
            }

            entry_ids.dedup();
            prop_assert_eq!(entry_ids.len(), 1);
            let stored = t
                .ledger
                .balance(BalanceOwner::Account(t.account_id), &usd)
                .unwrap()
                .unwrap();
            prop_assert_eq!(stored.available, amount);
            prop_assert_eq!(
                t.ledger.reconstruct_balance(BalanceOwner::Account(t.account_id), &usd).unwrap(),
                (amount, Decimal::ZERO)
            );
            Ok(())
        })?;
    }
}
