//! Currency catalog boundary
//!
//! The ledger never prices anything itself. Prices come from a
//! [`CurrencyCatalog`]; the coordinator freezes the returned price for the
//! duration of one operation.

use crate::{
    config::CatalogConfig,
    types::{AssetSymbol, CurrencyId},
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Symbols priced at 1 when the catalog carries no price history
const FIAT_SYMBOLS: &[&str] = &["USD", "USDT", "USDC", "EUR", "BRL", "GBP", "JPY", "CAD", "AUD"];

/// One catalog currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Catalog id
    pub id: CurrencyId,
    /// Ticker
    pub symbol: AssetSymbol,
    /// Display name
    pub name: String,
    /// Latest unit price in the quote asset
    pub current_price: Decimal,
}

/// Price source consumed by the coordinator
#[async_trait]
pub trait CurrencyCatalog: Send + Sync {
    /// Currency by catalog id
    async fn get_by_id(&self, id: CurrencyId) -> Result<Option<CatalogItem>>;

    /// Currency by ticker
    async fn get_by_symbol(&self, symbol: &AssetSymbol) -> Result<Option<CatalogItem>>;
}

/// In-memory catalog with settable prices
#[derive(Debug, Default)]
pub struct StaticCatalog {
    items: RwLock<HashMap<CurrencyId, CatalogItem>>,
}

impl StaticCatalog {
    /// Create empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a currency and return its id
    pub fn insert(&self, symbol: &str, price: Decimal) -> Result<CurrencyId> {
        let symbol = AssetSymbol::new(symbol)?;
        let id = CurrencyId::new();
        self.items.write().insert(
            id,
            CatalogItem {
                id,
                name: symbol.to_string(),
                symbol,
                current_price: price,
            },
        );
        Ok(id)
    }

    /// Change the price of a known currency
    pub fn set_price(&self, id: CurrencyId, price: Decimal) -> Result<()> {
        let mut items = self.items.write();
        let item = items
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Currency {}", id)))?;
        item.current_price = price;
        Ok(())
    }
}

#[async_trait]
impl CurrencyCatalog for StaticCatalog {
    async fn get_by_id(&self, id: CurrencyId) -> Result<Option<CatalogItem>> {
        Ok(self.items.read().get(&id).cloned())
    }

    async fn get_by_symbol(&self, symbol: &AssetSymbol) -> Result<Option<CatalogItem>> {
        Ok(self
            .items
            .read()
            .values()
            .find(|item| item.symbol == *symbol)
            .cloned())
    }
}

/// Catalog served by the currency HTTP service
///
/// `GET {base}/currency/{id}` and `GET {base}/currency`. Bodies may be bare
/// or wrapped in a `{"value": ...}` envelope; the price is the latest
/// positive entry of `histories`, or `currentPrice` when present.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    base_url: String,
    client: Client,
}

impl HttpCatalog {
    /// Create client from configuration
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build catalog client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn fetch(&self, path: &str) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ExternalService(format!(
                "Catalog returned {} for {}: {}",
                status, path, body
            )));
        }

        let body = response.json::<Value>().await?;
        debug!(path, "Catalog response received");
        Ok(Some(body))
    }
}

#[async_trait]
impl CurrencyCatalog for HttpCatalog {
    async fn get_by_id(&self, id: CurrencyId) -> Result<Option<CatalogItem>> {
        match self.fetch(&format!("/currency/{}", id)).await? {
            Some(body) => parse_item(&body, Some(id)),
            None => Ok(None),
        }
    }

    async fn get_by_symbol(&self, symbol: &AssetSymbol) -> Result<Option<CatalogItem>> {
        let Some(body) = self.fetch("/currency").await? else {
            return Ok(None);
        };
        Ok(parse_list(&body)?
            .into_iter()
            .find(|item| item.symbol == *symbol))
    }
}

/// Parse one currency, bare or enveloped
pub fn parse_item(body: &Value, fallback_id: Option<CurrencyId>) -> Result<Option<CatalogItem>> {
    let object = match body.get("value") {
        Some(inner) if inner.is_object() => inner,
        _ if body.is_object() => body,
        _ => return Ok(None),
    };

    let id = field(object, "id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .map(CurrencyId::from_uuid)
        .or(fallback_id)
        .ok_or_else(|| Error::ExternalService("Catalog item has no id".to_string()))?;

    let raw_symbol = field(object, "symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ExternalService(format!("Catalog item {} has no symbol", id)))?;
    let symbol = AssetSymbol::new(raw_symbol)
        .map_err(|e| Error::ExternalService(format!("Catalog item {}: {}", id, e)))?;

    let name = field(object, "name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut current_price = field(object, "currentPrice")
        .and_then(decimal)
        .or_else(|| latest_history_price(object))
        .unwrap_or(Decimal::ZERO);
    if current_price == Decimal::ZERO && FIAT_SYMBOLS.contains(&symbol.as_str()) {
        current_price = Decimal::ONE;
    }

    Ok(Some(CatalogItem {
        id,
        symbol,
        name,
        current_price,
    }))
}

/// Parse a currency list, bare or enveloped; malformed items are skipped
pub fn parse_list(body: &Value) -> Result<Vec<CatalogItem>> {
    let items = match body {
        Value::Array(items) => items,
        _ => match body.get("value") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(Error::ExternalService(
                    "Catalog list is neither an array nor an envelope".to_string(),
                ))
            }
        },
    };

    let mut parsed = Vec::with_capacity(items.len());
    for item in items {
        match parse_item(item, None) {
            Ok(Some(item)) => parsed.push(item),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Skipping malformed catalog item"),
        }
    }
    Ok(parsed)
}

/// Field by camelCase or PascalCase name
fn field<'a>(object: &'a Value, name: &str) -> Option<&'a Value> {
    object.get(name).or_else(|| {
        let mut pascal = name.to_string();
        if let Some(first) = pascal.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        object.get(&pascal)
    })
}

fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn latest_history_price(object: &Value) -> Option<Decimal> {
    field(object, "histories")?
        .as_array()?
        .iter()
        .filter_map(|entry| match entry {
            Value::Object(_) => entry.get("value").and_then(decimal),
            other => decimal(other),
        })
        .filter(|price| *price > Decimal::ZERO)
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_enveloped_item_with_history() {
        let id = Uuid::now_v7();
        let body = json!({
            "value": {
                "id": id.to_string(),
                "symbol": "btc",
                "name": "Bitcoin",
                "histories": [
                    {"value": 48000.5, "when": "2025-01-01"},
                    {"value": "0"},
                    {"value": "50000"}
                ]
            }
        });

        let item = parse_item(&body, None).unwrap().unwrap();
        assert_eq!(item.id.as_uuid(), id);
        assert_eq!(item.symbol.as_str(), "BTC");
        assert_eq!(item.name, "Bitcoin");
        assert_eq!(item.current_price, dec!(50000));
    }

    #[test]
    fn test_parse_pascal_case_and_fiat_default() {
        let id = CurrencyId::new();
        let body = json!({"Symbol": "USD", "Name": "Dollar"});
        let item = parse_item(&body, Some(id)).unwrap().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.current_price, dec!(1));
    }

    #[test]
    fn test_parse_explicit_current_price() {
        let body = json!({"id": Uuid::now_v7().to_string(), "symbol": "ETH", "currentPrice": "3000.25"});
        let item = parse_item(&body, None).unwrap().unwrap();
        assert_eq!(item.current_price, dec!(3000.25));
    }

    #[test]
    fn test_parse_list_skips_malformed() {
        let body = json!({
            "value": [
                {"id": Uuid::now_v7().to_string(), "symbol": "ETH", "histories": [3000]},
                {"id": Uuid::now_v7().to_string()},
                {"id": Uuid::now_v7().to_string(), "symbol": "SOL", "histories": ["150.5"]}
            ]
        });
        let items = parse_list(&body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].current_price, dec!(3000));
        assert_eq!(items[1].symbol.as_str(), "SOL");

        assert!(parse_list(&json!("nope")).is_err());
    }

    #[tokio::test]
    async fn test_static_catalog() {
        let catalog = StaticCatalog::new();
        let id = catalog.insert("btc", dec!(50000)).unwrap();

        let item = catalog.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(item.current_price, dec!(50000));

        catalog.set_price(id, dec!(51000)).unwrap();
        let by_symbol = catalog
            .get_by_symbol(&AssetSymbol::new("BTC").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_symbol.current_price, dec!(51000));
        assert!(catalog.get_by_id(CurrencyId::new()).await.unwrap().is_none());
    }
}
