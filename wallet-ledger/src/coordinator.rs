//! Operation coordinator
//!
//! Runs buy, sell and swap as single units of work spanning the account
//! ledger, the position tracker and the journal. Every request moves
//! through
//!
//! ```text
//! Validating -> PricingResolved -> Applying -> Committed | RolledBack
//! ```
//!
//! The price lookup is the only await point and happens before the unit of
//! work is opened. The apply phase is synchronous, so a request dropped
//! while waiting for a price leaves nothing behind, and once the unit of
//! work starts it runs to commit or rollback.

use crate::{
    accounts::{self, AccountRegistry},
    balances::{self, AccountLedger},
    catalog::{CatalogItem, CurrencyCatalog},
    config::{Config, LedgerRules},
    journal::{JournalRecord, NewEntry, TransactionJournal},
    keys,
    metrics::Metrics,
    operations::{
        BuyReceipt, BuyRequest, OperationResult, Receipt, SellReceipt, SellRequest, SwapReceipt,
        SwapRequest,
    },
    positions::{LotSelection, PositionTracker},
    retry::CasRetry,
    storage::Storage,
    types::{
        checked_div, checked_mul, AccountId, BalanceEffect, BalanceOwner, CryptoDetail,
        CurrencyId, EntryDetail, EntryId, EntryStatus, EntryType, LotConsumption, WalletId,
    },
    unit_of_work::UnitOfWork,
    Error, Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Request lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    /// Checking identifiers and amounts
    Validating,
    /// Price fetched and frozen
    PricingResolved,
    /// Unit of work open
    Applying,
    /// Unit of work committed (or answered from an earlier entry)
    Committed,
    /// Nothing was written
    RolledBack,
}

impl OperationPhase {
    /// Allowed phase changes
    ///
    /// Unpriced operations go straight from `Validating` to `Applying`;
    /// replays of an earlier entry commit straight from `Validating`.
    pub fn can_advance_to(&self, next: OperationPhase) -> bool {
        use OperationPhase::*;
        matches!(
            (self, next),
            (Validating, PricingResolved)
                | (Validating, Applying)
                | (Validating, Committed)
                | (Validating, RolledBack)
                | (PricingResolved, Applying)
                | (PricingResolved, RolledBack)
                | (Applying, Committed)
                | (Applying, RolledBack)
        )
    }

    /// Whether the request is finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationPhase::Committed | OperationPhase::RolledBack)
    }
}

/// Per-request state carried through the phases
#[derive(Debug)]
pub struct RequestContext {
    operation: &'static str,
    correlation_id: Uuid,
    phase: OperationPhase,
    started: Instant,
}

impl RequestContext {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            correlation_id: Uuid::now_v7(),
            phase: OperationPhase::Validating,
            started: Instant::now(),
        }
    }

    /// Correlation id attached to logs, results and faults
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Current phase
    pub fn phase(&self) -> OperationPhase {
        self.phase
    }

    fn advance(&mut self, next: OperationPhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(Error::InvariantViolation(format!(
                "{} cannot move from {:?} to {:?}",
                self.operation, self.phase, next
            )));
        }
        debug!(from = ?self.phase, to = ?next, "Phase changed");
        self.phase = next;
        Ok(())
    }

    fn span(&self) -> Span {
        info_span!(
            "operation",
            operation = self.operation,
            correlation_id = %self.correlation_id
        )
    }
}

/// Orchestrates priced operations as single units of work
pub struct OperationCoordinator {
    storage: Arc<Storage>,
    registry: AccountRegistry,
    ledger: AccountLedger,
    tracker: PositionTracker,
    journal: TransactionJournal,
    catalog: Arc<dyn CurrencyCatalog>,
    metrics: Arc<Metrics>,
    rules: LedgerRules,
    retry: CasRetry,
    price_timeout: Duration,
}

impl std::fmt::Debug for OperationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCoordinator")
            .field("rules", &self.rules)
            .field("retry", &self.retry)
            .field("price_timeout", &self.price_timeout)
            .finish_non_exhaustive()
    }
}

impl OperationCoordinator {
    /// Wire the components over one store
    pub fn new(
        storage: Arc<Storage>,
        catalog: Arc<dyn CurrencyCatalog>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Result<Self> {
        let rules = config.rules()?;
        let journal = TransactionJournal::new(storage.clone());
        Ok(Self {
            registry: AccountRegistry::new(storage.clone()),
            ledger: AccountLedger::new(storage.clone(), journal.clone(), rules.clone()),
            tracker: PositionTracker::new(storage.clone(), rules.clone()),
            journal,
            storage,
            catalog,
            metrics,
            rules,
            retry: CasRetry::new(config.max_cas_attempts),
            price_timeout: Duration::from_millis(config.price_timeout_ms),
        })
    }

    /// Account and wallet registry
    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    /// Account ledger
    pub fn ledger(&self) -> &AccountLedger {
        &self.ledger
    }

    /// Position tracker
    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    /// Transaction journal
    pub fn journal(&self) -> &TransactionJournal {
        &self.journal
    }

    /// Amount rules
    pub fn rules(&self) -> &LedgerRules {
        &self.rules
    }

    /// Buy an asset with cash
    pub async fn buy(&self, request: BuyRequest) -> Result<OperationResult<BuyReceipt>> {
        let mut ctx = RequestContext::new("buy");
        let span = ctx.span();
        async move {
            let outcome = self.execute_buy(&mut ctx, &request).await;
            self.finish(ctx, outcome)
        }
        .instrument(span)
        .await
    }

    /// Sell an asset for cash
    pub async fn sell(&self, request: SellRequest) -> Result<OperationResult<SellReceipt>> {
        let mut ctx = RequestContext::new("sell");
        let span = ctx.span();
        async move {
            let outcome = self.execute_sell(&mut ctx, &request).await;
            self.finish(ctx, outcome)
        }
        .instrument(span)
        .await
    }

    /// Exchange one asset for another
    pub async fn swap(&self, request: SwapRequest) -> Result<OperationResult<SwapReceipt>> {
        let mut ctx = RequestContext::new("swap");
        let span = ctx.span();
        async move {
            let outcome = self.execute_swap(&mut ctx, &request).await;
            self.finish(ctx, outcome)
        }
        .instrument(span)
        .await
    }

    /// Run an operation that needs no price through the same lifecycle
    pub async fn run_unpriced<T, F>(
        &self,
        operation: &'static str,
        body: F,
    ) -> Result<OperationResult<T>>
    where
        T: Receipt,
        F: Fn(&UnitOfWork<'_>) -> Result<T>,
    {
        let mut ctx = RequestContext::new(operation);
        let span = ctx.span();
        async move {
            let outcome = ctx
                .advance(OperationPhase::Applying)
                .and_then(|()| self.in_unit(operation, &body));
            self.finish(ctx, outcome)
        }
        .instrument(span)
        .await
    }

    /// Run `body` in a fresh unit of work, committing on success and
    /// re-running it on conflict
    pub(crate) fn in_unit<T, F>(&self, operation: &str, body: F) -> Result<T>
    where
        F: Fn(&UnitOfWork<'_>) -> Result<T>,
    {
        self.retry.run(
            operation,
            |attempt| {
                let uow = self.storage.begin();
                let value = body(&uow)?;
                let journaled = uow.journaled();
                uow.commit()?;

                for entry_type in journaled {
                    self.metrics.record_entry(entry_type.as_str());
                }
                if attempt > 1 {
                    debug!(attempt, "Committed after retry");
                }
                Ok(value)
            },
            || self.metrics.record_cas_retry(),
        )
    }

    async fn execute_buy(&self, ctx: &mut RequestContext, req: &BuyRequest) -> Result<BuyReceipt> {
        self.rules.check_amount("Fiat amount", req.fiat_amount)?;
        self.rules.check_fee(req.fee)?;
        if req.fiat_amount <= req.fee {
            return Err(Error::Validation(format!(
                "Fiat amount {} does not exceed fee {}",
                req.fiat_amount, req.fee
            )));
        }
        self.registry.check_wallet(req.account_id, req.wallet_id)?;
        if let Some(receipt) = self.in_unit("buy", |uow| self.replay_buy(uow, req))? {
            return Ok(receipt);
        }

        let item = self.resolve_price(req.currency_id).await?;
        self.reject_quote_asset(&item)?;
        ctx.advance(OperationPhase::PricingResolved)?;

        let price = item.current_price;
        let purchased = self
            .rules
            .round_amount(checked_div(req.fiat_amount - req.fee, price)?);
        if purchased < self.rules.minimal_unit {
            return Err(Error::Validation(format!(
                "{} {} at {} buys less than the minimal unit",
                req.fiat_amount, self.rules.quote_asset, price
            )));
        }

        ctx.advance(OperationPhase::Applying)?;
        self.in_unit("buy", |uow| {
            if let Some(receipt) = self.replay_buy(uow, req)? {
                return Ok(receipt);
            }
            accounts::require_active(uow, req.account_id)?;
            accounts::require_wallet(uow, req.account_id, req.wallet_id)?;

            let cash_effect = BalanceEffect::available(
                BalanceOwner::Account(req.account_id),
                self.rules.quote_asset.clone(),
                -req.fiat_amount,
            );
            let cash = balances::apply_effect(uow, &cash_effect)?;
            let bought = self.tracker.apply_buy(
                uow,
                req.wallet_id,
                &item.symbol,
                purchased,
                price,
                req.create_new_lot,
            )?;

            let entry = self.journal.append(
                uow,
                NewEntry::new(
                    EntryType::Buy,
                    req.account_id,
                    item.symbol.clone(),
                    req.fiat_amount,
                )
                .with_wallet(req.wallet_id)
                .with_fee(req.fee)
                .with_reference(req.reference.clone())
                .with_effect(cash_effect)
                .with_effect(BalanceEffect::available(
                    BalanceOwner::Wallet(req.wallet_id),
                    item.symbol.clone(),
                    purchased,
                )),
                EntryDetail::Crypto(CryptoDetail {
                    currency_id: item.id,
                    symbol: item.symbol.clone(),
                    exchange_rate: price,
                    crypto_amount: purchased,
                    realized_pnl: None,
                    lots: vec![LotConsumption {
                        lot_id: bought.lot.id,
                        amount: purchased,
                        unit_acquisition_price: bought.lot.unit_acquisition_price,
                        remaining_after: bought.lot.remaining_amount,
                    }],
                }),
            )?;

            info!(
                entry_id = %entry.id,
                asset = %item.symbol,
                purchased = %purchased,
                price = %price,
                "Buy applied"
            );

            Ok(BuyReceipt {
                entry_id: entry.id,
                lot_id: bought.lot.id,
                purchased_amount: purchased,
                unit_price: price,
                fiat_amount: req.fiat_amount,
                fee: req.fee,
                cash,
                position: bought.position,
                replayed: false,
            })
        })
    }

    async fn execute_sell(
        &self,
        ctx: &mut RequestContext,
        req: &SellRequest,
    ) -> Result<SellReceipt> {
        self.rules.check_amount("Amount", req.amount)?;
        self.rules.check_fee(req.fee)?;
        if let Some(lot_amount) = req.lot_amount {
            self.rules.check_amount("Lot amount", lot_amount)?;
        }
        let selection = LotSelection::from_request(req.lot_id, req.lot_amount)?;
        self.registry.check_wallet(req.account_id, req.wallet_id)?;
        if let Some(receipt) = self.in_unit("sell", |uow| self.replay_sell(uow, req))? {
            return Ok(receipt);
        }

        let item = self.resolve_price(req.currency_id).await?;
        self.reject_quote_asset(&item)?;
        ctx.advance(OperationPhase::PricingResolved)?;

        let price = item.current_price;
        let gross = self.rules.round_amount(checked_mul(req.amount, price)?);
        if req.fee > gross {
            return Err(Error::Validation(format!(
                "Fee {} exceeds the sale value {}",
                req.fee, gross
            )));
        }
        let proceeds = gross - req.fee;

        ctx.advance(OperationPhase::Applying)?;
        self.in_unit("sell", |uow| {
            if let Some(receipt) = self.replay_sell(uow, req)? {
                return Ok(receipt);
            }
            accounts::require_active(uow, req.account_id)?;
            accounts::require_wallet(uow, req.account_id, req.wallet_id)?;

            let cash_owner = BalanceOwner::Account(req.account_id);
            // Cash row before position row, as in buy
            let mut cash = balances::load_for_update(uow, cash_owner, &self.rules.quote_asset)?;
            let sold = self.tracker.apply_sell(
                uow,
                req.wallet_id,
                &item.symbol,
                req.amount,
                price,
                selection,
            )?;

            let mut entry = NewEntry::new(EntryType::Sell, req.account_id, item.symbol.clone(), gross)
                .with_wallet(req.wallet_id)
                .with_fee(req.fee)
                .with_reference(req.reference.clone())
                .with_effect(BalanceEffect::available(
                    BalanceOwner::Wallet(req.wallet_id),
                    item.symbol.clone(),
                    -req.amount,
                ));
            if proceeds > Decimal::ZERO {
                let cash_effect =
                    BalanceEffect::available(cash_owner, self.rules.quote_asset.clone(), proceeds);
                cash = balances::apply_effect(uow, &cash_effect)?;
                entry = entry.with_effect(cash_effect);
            }

            let entry = self.journal.append(
                uow,
                entry,
                EntryDetail::Crypto(CryptoDetail {
                    currency_id: item.id,
                    symbol: item.symbol.clone(),
                    exchange_rate: price,
                    crypto_amount: -req.amount,
                    realized_pnl: Some(sold.realized_pnl),
                    lots: sold.consumed.clone(),
                }),
            )?;

            info!(
                entry_id = %entry.id,
                asset = %item.symbol,
                amount = %req.amount,
                price = %price,
                realized_pnl = %sold.realized_pnl,
                lots = sold.consumed.len(),
                "Sell applied"
            );

            Ok(SellReceipt {
                entry_id: entry.id,
                sold_amount: req.amount,
                unit_price: price,
                gross,
                fee: req.fee,
                proceeds,
                realized_pnl: sold.realized_pnl,
                consumed: sold.consumed,
                cash,
                position: sold.position,
                replayed: false,
            })
        })
    }

    async fn execute_swap(
        &self,
        ctx: &mut RequestContext,
        req: &SwapRequest,
    ) -> Result<SwapReceipt> {
        self.rules.check_amount("Amount out", req.amount_out)?;
        self.rules.check_fee(req.fee)?;
        if req.currency_out_id == req.currency_in_id {
            return Err(Error::Validation(
                "Swap needs two different currencies".to_string(),
            ));
        }
        self.registry.check_wallet(req.account_id, req.wallet_id)?;
        if let Some(receipt) = self.in_unit("swap", |uow| self.replay_swap(uow, req))? {
            return Ok(receipt);
        }

        let out = self.resolve_price(req.currency_out_id).await?;
        let inbound = self.resolve_price(req.currency_in_id).await?;
        self.reject_quote_asset(&out)?;
        self.reject_quote_asset(&inbound)?;
        if out.symbol == inbound.symbol {
            return Err(Error::Validation(format!(
                "Both swap legs resolve to {}",
                out.symbol
            )));
        }
        ctx.advance(OperationPhase::PricingResolved)?;

        let fiat_value = self
            .rules
            .round_amount(checked_mul(req.amount_out, out.current_price)?);
        if req.fee >= fiat_value {
            return Err(Error::Validation(format!(
                "Fee {} leaves nothing of the swap value {}",
                req.fee, fiat_value
            )));
        }
        let proceeds = fiat_value - req.fee;
        let amount_in = self
            .rules
            .round_amount(checked_div(proceeds, inbound.current_price)?);
        if amount_in < self.rules.minimal_unit {
            return Err(Error::Validation(format!(
                "Swap proceeds {} buy less than the minimal unit of {}",
                proceeds, inbound.symbol
            )));
        }

        ctx.advance(OperationPhase::Applying)?;
        self.in_unit("swap", |uow| {
            if let Some(receipt) = self.replay_swap(uow, req)? {
                return Ok(receipt);
            }
            accounts::require_active(uow, req.account_id)?;
            accounts::require_wallet(uow, req.account_id, req.wallet_id)?;

            let owner = BalanceOwner::Wallet(req.wallet_id);
            let mut legs = [&out.symbol, &inbound.symbol];
            legs.sort_by_key(|symbol| keys::balance_key(&owner, symbol));
            for symbol in legs {
                balances::load_for_update(uow, owner, symbol)?;
            }

            let sold = self.tracker.apply_sell(
                uow,
                req.wallet_id,
                &out.symbol,
                req.amount_out,
                out.current_price,
                LotSelection::Fifo,
            )?;
            let bought = self.tracker.apply_buy(
                uow,
                req.wallet_id,
                &inbound.symbol,
                amount_in,
                inbound.current_price,
                true,
            )?;

            let out_id = EntryId::new();
            let in_id = EntryId::new();
            self.journal.append(
                uow,
                NewEntry::new(EntryType::SwapOut, req.account_id, out.symbol.clone(), fiat_value)
                    .with_id(out_id)
                    .with_wallet(req.wallet_id)
                    .with_fee(req.fee)
                    .with_reference(req.reference.clone())
                    .with_related(in_id)
                    .with_effect(BalanceEffect::available(owner, out.symbol.clone(), -req.amount_out)),
                EntryDetail::Crypto(CryptoDetail {
                    currency_id: out.id,
                    symbol: out.symbol.clone(),
                    exchange_rate: out.current_price,
                    crypto_amount: -req.amount_out,
                    realized_pnl: Some(sold.realized_pnl),
                    lots: sold.consumed.clone(),
                }),
            )?;
            self.journal.append(
                uow,
                NewEntry::new(EntryType::SwapIn, req.account_id, inbound.symbol.clone(), proceeds)
                    .with_id(in_id)
                    .with_wallet(req.wallet_id)
                    .with_related(out_id)
                    .with_effect(BalanceEffect::available(owner, inbound.symbol.clone(), amount_in)),
                EntryDetail::Crypto(CryptoDetail {
                    currency_id: inbound.id,
                    symbol: inbound.symbol.clone(),
                    exchange_rate: inbound.current_price,
                    crypto_amount: amount_in,
                    realized_pnl: None,
                    lots: vec![LotConsumption {
                        lot_id: bought.lot.id,
                        amount: amount_in,
                        unit_acquisition_price: bought.lot.unit_acquisition_price,
                        remaining_after: bought.lot.remaining_amount,
                    }],
                }),
            )?;

            info!(
                out_entry_id = %out_id,
                in_entry_id = %in_id,
                asset_out = %out.symbol,
                asset_in = %inbound.symbol,
                amount_out = %req.amount_out,
                amount_in = %amount_in,
                "Swap applied"
            );

            Ok(SwapReceipt {
                out_entry_id: out_id,
                in_entry_id: in_id,
                amount_out: req.amount_out,
                amount_in,
                price_out: out.current_price,
                price_in: inbound.current_price,
                fiat_value,
                fee: req.fee,
                realized_pnl: sold.realized_pnl,
                consumed: sold.consumed,
                lot_id: bought.lot.id,
                position_out: sold.position,
                position_in: bought.position,
                replayed: false,
            })
        })
    }

    fn replay_buy(&self, uow: &UnitOfWork<'_>, req: &BuyRequest) -> Result<Option<BuyReceipt>> {
        let Some(record) = self.find_reference(uow, req.account_id, &req.reference)? else {
            return Ok(None);
        };
        let detail = expect_replay(&record, EntryType::Buy, req.wallet_id)?;
        if detail.currency_id != req.currency_id
            || record.entry.amount != req.fiat_amount
            || record.entry.fee != req.fee
        {
            return Err(reused_with_different_parameters(&record));
        }
        let lot = detail.lots.first().ok_or_else(|| {
            Error::InvariantViolation(format!("Buy entry {} names no lot", record.entry.id))
        })?;

        debug!(entry_id = %record.entry.id, "Replaying completed buy");
        Ok(Some(BuyReceipt {
            entry_id: record.entry.id,
            lot_id: lot.lot_id,
            purchased_amount: detail.crypto_amount,
            unit_price: detail.exchange_rate,
            fiat_amount: record.entry.amount,
            fee: record.entry.fee,
            cash: balances::load(
                uow,
                BalanceOwner::Account(req.account_id),
                &self.rules.quote_asset,
            )?,
            position: balances::load(uow, BalanceOwner::Wallet(req.wallet_id), &detail.symbol)?,
            replayed: true,
        }))
    }

    fn replay_sell(&self, uow: &UnitOfWork<'_>, req: &SellRequest) -> Result<Option<SellReceipt>> {
        let Some(record) = self.find_reference(uow, req.account_id, &req.reference)? else {
            return Ok(None);
        };
        let detail = expect_replay(&record, EntryType::Sell, req.wallet_id)?;
        if detail.currency_id != req.currency_id
            || -detail.crypto_amount != req.amount
            || record.entry.fee != req.fee
            || !same_lot_selection(detail, req)
        {
            return Err(reused_with_different_parameters(&record));
        }

        debug!(entry_id = %record.entry.id, "Replaying completed sell");
        Ok(Some(SellReceipt {
            entry_id: record.entry.id,
            sold_amount: -detail.crypto_amount,
            unit_price: detail.exchange_rate,
            gross: record.entry.amount,
            fee: record.entry.fee,
            proceeds: record.entry.amount - record.entry.fee,
            realized_pnl: detail.realized_pnl.unwrap_or_default(),
            consumed: detail.lots.clone(),
            cash: balances::load(
                uow,
                BalanceOwner::Account(req.account_id),
                &self.rules.quote_asset,
            )?,
            position: balances::load(uow, BalanceOwner::Wallet(req.wallet_id), &detail.symbol)?,
            replayed: true,
        }))
    }

    fn replay_swap(&self, uow: &UnitOfWork<'_>, req: &SwapRequest) -> Result<Option<SwapReceipt>> {
        let Some(record) = self.find_reference(uow, req.account_id, &req.reference)? else {
            return Ok(None);
        };
        let out = expect_replay(&record, EntryType::SwapOut, req.wallet_id)?;
        let in_id = record.entry.related_entry_id.ok_or_else(|| {
            Error::InvariantViolation(format!("Swap entry {} has no inbound leg", record.entry.id))
        })?;
        let in_record = self.journal.record_in(uow, in_id)?;
        let inbound = crypto_detail(&in_record)?;
        if out.currency_id != req.currency_out_id
            || inbound.currency_id != req.currency_in_id
            || -out.crypto_amount != req.amount_out
            || record.entry.fee != req.fee
        {
            return Err(reused_with_different_parameters(&record));
        }
        let lot = inbound.lots.first().ok_or_else(|| {
            Error::InvariantViolation(format!("Swap entry {} names no lot", in_id))
        })?;

        let owner = BalanceOwner::Wallet(req.wallet_id);
        debug!(entry_id = %record.entry.id, "Replaying completed swap");
        Ok(Some(SwapReceipt {
            out_entry_id: record.entry.id,
            in_entry_id: in_id,
            amount_out: -out.crypto_amount,
            amount_in: inbound.crypto_amount,
            price_out: out.exchange_rate,
            price_in: inbound.exchange_rate,
            fiat_value: record.entry.amount,
            fee: record.entry.fee,
            realized_pnl: out.realized_pnl.unwrap_or_default(),
            consumed: out.lots.clone(),
            lot_id: lot.lot_id,
            position_out: balances::load(uow, owner, &out.symbol)?,
            position_in: balances::load(uow, owner, &inbound.symbol)?,
            replayed: true,
        }))
    }

    fn find_reference(
        &self,
        uow: &UnitOfWork<'_>,
        account_id: AccountId,
        reference: &Option<String>,
    ) -> Result<Option<JournalRecord>> {
        match reference {
            Some(reference) => self.journal.find_reference(uow, account_id, reference),
            None => Ok(None),
        }
    }

    /// Fetch and freeze a price, bounded by the configured timeout
    async fn resolve_price(&self, currency_id: CurrencyId) -> Result<CatalogItem> {
        let lookup = tokio::time::timeout(self.price_timeout, self.catalog.get_by_id(currency_id));
        let item = match lookup.await {
            Err(_) => {
                self.metrics.record_price_failure();
                return Err(Error::ExternalService(format!(
                    "Price lookup for {} timed out after {:?}",
                    currency_id, self.price_timeout
                )));
            }
            Ok(Err(err)) => {
                self.metrics.record_price_failure();
                return Err(match err {
                    Error::ExternalService(_) => err,
                    other => Error::ExternalService(other.to_string()),
                });
            }
            Ok(Ok(None)) => {
                return Err(Error::NotFound(format!("Currency {}", currency_id)));
            }
            Ok(Ok(Some(item))) => item,
        };

        let price = self.rules.round_price(item.current_price);
        if price <= Decimal::ZERO {
            self.metrics.record_price_failure();
            return Err(Error::ExternalService(format!(
                "Catalog has no usable price for {} ({})",
                item.symbol, item.current_price
            )));
        }

        debug!(currency_id = %currency_id, symbol = %item.symbol, price = %price, "Price resolved");
        Ok(CatalogItem {
            current_price: price,
            ..item
        })
    }

    fn reject_quote_asset(&self, item: &CatalogItem) -> Result<()> {
        if item.symbol == self.rules.quote_asset {
            return Err(Error::Validation(format!(
                "{} is the cash asset; use a balance adjustment",
                item.symbol
            )));
        }
        Ok(())
    }

    fn finish<T: Receipt>(
        &self,
        mut ctx: RequestContext,
        outcome: Result<T>,
    ) -> Result<OperationResult<T>> {
        let elapsed = ctx.started.elapsed().as_secs_f64();
        let correlation_id = ctx.correlation_id;

        match outcome {
            Ok(data) => {
                ctx.advance(OperationPhase::Committed)
                    .map_err(|e| e.with_correlation(correlation_id))?;
                let outcome = if data.replayed() { "replayed" } else { "committed" };
                self.metrics.record_operation(ctx.operation, outcome, elapsed);
                info!(outcome, duration_ms = elapsed * 1000.0, "Operation committed");
                Ok(OperationResult::success(correlation_id, data))
            }
            Err(err) => {
                let failed_in = ctx.phase;
                if let Err(e) = ctx.advance(OperationPhase::RolledBack) {
                    error!(error = %e, "Rollback from a terminal phase");
                }

                if err.is_business() {
                    let kind = err.kind();
                    self.metrics.record_operation(ctx.operation, kind.as_str(), elapsed);
                    warn!(phase = ?failed_in, kind = kind.as_str(), error = %err, "Operation rejected");
                    Ok(OperationResult::failure(correlation_id, &err))
                } else {
                    self.metrics.record_operation(ctx.operation, "fault", elapsed);
                    error!(phase = ?failed_in, error = %err, "Operation rolled back on fault");
                    Err(err.with_correlation(correlation_id))
                }
            }
        }
    }
}

/// Check that a referenced entry is a completed entry of the expected kind
fn expect_replay(
    record: &JournalRecord,
    entry_type: EntryType,
    wallet_id: WalletId,
) -> Result<&CryptoDetail> {
    let entry = &record.entry;
    if entry.entry_type != entry_type || entry.wallet_id != Some(wallet_id) {
        return Err(Error::Validation(format!(
            "Reference {:?} belongs to a different operation",
            entry.reference
        )));
    }
    if entry.status != EntryStatus::Completed {
        return Err(Error::Validation(format!(
            "Reference {:?} belongs to a {:?} entry",
            entry.reference, entry.status
        )));
    }
    crypto_detail(record)
}

fn reused_with_different_parameters(record: &JournalRecord) -> Error {
    Error::Validation(format!(
        "Reference {:?} reused with different parameters",
        record.entry.reference
    ))
}

/// A named lot must lead the consumed lots, taking the requested amount
fn same_lot_selection(detail: &CryptoDetail, req: &SellRequest) -> bool {
    let Some(lot_id) = req.lot_id else {
        return true;
    };
    match detail.lots.first() {
        Some(first) if first.lot_id == lot_id => match req.lot_amount {
            Some(lot_amount) => first.amount == lot_amount,
            None => detail.lots.len() == 1,
        },
        _ => false,
    }
}

fn crypto_detail(record: &JournalRecord) -> Result<&CryptoDetail> {
    match &record.detail {
        EntryDetail::Crypto(detail) => Ok(detail),
        EntryDetail::Fiat(_) => Err(Error::InvariantViolation(format!(
            "Trade entry {} has a fiat detail row",
            record.entry.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::operations::AdjustReceipt;
    use crate::types::{AssetSymbol, FiatDetail, UserId};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    struct Fixture {
        coordinator: OperationCoordinator,
        catalog: Arc<StaticCatalog>,
        metrics: Arc<Metrics>,
        account_id: AccountId,
        wallet_id: WalletId,
        btc: CurrencyId,
        eth: CurrencyId,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());

        let catalog = Arc::new(StaticCatalog::new());
        let btc = catalog.insert("BTC", dec!(50000)).unwrap();
        let eth = catalog.insert("ETH", dec!(2500)).unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let coordinator =
            OperationCoordinator::new(storage, catalog.clone(), metrics.clone(), &config).unwrap();

        let (account_id, wallet_id) = coordinator
            .in_unit("setup", |uow| {
                let account = coordinator.registry().open_account(uow, UserId::new())?;
                let wallet = coordinator.registry().open_wallet(uow, account.id, "main")?;
                Ok((account.id, wallet.id))
            })
            .unwrap();

        Fixture {
            coordinator,
            catalog,
            metrics,
            account_id,
            wallet_id,
            btc,
            eth,
            _temp: temp_dir,
        }
    }

    impl Fixture {
        async fn deposit(&self, amount: Decimal) -> OperationResult<AdjustReceipt> {
            let usd = AssetSymbol::new("USD").unwrap();
            self.coordinator
                .run_unpriced("adjust_balance", |uow| {
                    self.coordinator.ledger().adjust_balance(
                        uow,
                        self.account_id,
                        &usd,
                        amount,
                        None,
                        FiatDetail::default(),
                    )
                })
                .await
                .unwrap()
        }

        fn buy_request(&self, fiat_amount: Decimal, fee: Decimal) -> BuyRequest {
            BuyRequest {
                account_id: self.account_id,
                wallet_id: self.wallet_id,
                currency_id: self.btc,
                fiat_amount,
                fee,
                create_new_lot: true,
                reference: None,
            }
        }
    }

    #[test]
    fn test_phase_transitions() {
        use OperationPhase::*;
        assert!(Validating.can_advance_to(PricingResolved));
        assert!(PricingResolved.can_advance_to(Applying));
        assert!(Applying.can_advance_to(Committed));
        assert!(Applying.can_advance_to(RolledBack));

        assert!(!PricingResolved.can_advance_to(Committed));
        assert!(!Committed.can_advance_to(RolledBack));
        assert!(!RolledBack.can_advance_to(Applying));
        assert!(Committed.is_terminal());
    }

    #[tokio::test]
    async fn test_buy_debits_cash_and_creates_lot() {
        let f = fixture();
        f.deposit(dec!(1000)).await;

        let result = f
            .coordinator
            .buy(f.buy_request(dec!(1000), dec!(10)))
            .await
            .unwrap();
        assert!(result.is_success, "{:?}", result.error);
        let receipt = result.data.unwrap();
        assert_eq!(receipt.purchased_amount, dec!(0.0198));
        assert_eq!(receipt.cash.available, dec!(0));
        assert_eq!(receipt.position.available, dec!(0.0198));
        assert_eq!(f.metrics.operation_count("buy", "committed"), 1);
    }

    #[tokio::test]
    async fn test_buy_rejections_are_results() {
        let f = fixture();
        f.deposit(dec!(100)).await;

        let result = f
            .coordinator
            .buy(f.buy_request(dec!(500), dec!(1)))
            .await
            .unwrap();
        assert!(!result.is_success);
        assert_eq!(result.error_kind, Some(crate::ErrorKind::InsufficientFunds));

        let result = f
            .coordinator
            .buy(f.buy_request(dec!(10), dec!(10)))
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(crate::ErrorKind::Validation));
        assert_eq!(f.metrics.operation_count("buy", "validation"), 1);
    }

    #[tokio::test]
    async fn test_unusable_price_is_external_failure() {
        let f = fixture();
        f.deposit(dec!(100)).await;
        f.catalog.set_price(f.btc, dec!(0)).unwrap();

        let result = f
            .coordinator
            .buy(f.buy_request(dec!(50), dec!(0)))
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(crate::ErrorKind::ExternalService));
        assert_eq!(f.metrics.price_lookup_failures.get(), 1);

        let mut unknown = f.buy_request(dec!(50), dec!(0));
        unknown.currency_id = CurrencyId::new();
        let result = f.coordinator.buy(unknown).await.unwrap();
        assert_eq!(result.error_kind, Some(crate::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_swap_moves_value_between_positions() {
        let f = fixture();
        f.deposit(dec!(1010)).await;
        f.coordinator
            .buy(f.buy_request(dec!(1010), dec!(10)))
            .await
            .unwrap();

        let result = f
            .coordinator
            .swap(SwapRequest {
                account_id: f.account_id,
                wallet_id: f.wallet_id,
                currency_out_id: f.btc,
                currency_in_id: f.eth,
                amount_out: dec!(0.01),
                fee: dec!(5),
                reference: None,
            })
            .await
            .unwrap();
        assert!(result.is_success, "{:?}", result.error);
        let receipt = result.data.unwrap();

        // 0.01 × 50000 = 500, minus 5, over 2500
        assert_eq!(receipt.fiat_value, dec!(500));
        assert_eq!(receipt.amount_in, dec!(0.198));
        assert_eq!(receipt.position_out.available, dec!(0.01));
        assert_eq!(receipt.position_in.available, dec!(0.198));

        let out = f.coordinator.journal().entry(receipt.out_entry_id).unwrap().unwrap();
        let inbound = f.coordinator.journal().entry(receipt.in_entry_id).unwrap().unwrap();
        assert_eq!(out.related_entry_id, Some(inbound.id));
        assert_eq!(inbound.related_entry_id, Some(out.id));
    }

    #[tokio::test]
    async fn test_swap_same_currency_rejected() {
        let f = fixture();
        let result = f
            .coordinator
            .swap(SwapRequest {
                account_id: f.account_id,
                wallet_id: f.wallet_id,
                currency_out_id: f.btc,
                currency_in_id: f.btc,
                amount_out: dec!(1),
                fee: dec!(0),
                reference: None,
            })
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(crate::ErrorKind::Validation));
    }
}
