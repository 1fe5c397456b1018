//! Configuration for the wallet ledger

use crate::types::AssetSymbol;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Cash asset debited by buys and credited by sells
    pub quote_asset: String,

    /// Smallest accepted balance adjustment
    #[serde(with = "rust_decimal::serde::str")]
    pub minimal_unit: Decimal,

    /// Decimal places kept on asset amounts
    pub amount_scale: u32,

    /// Decimal places kept on prices
    pub price_scale: u32,

    /// Attempts for optimistic read-modify-write units of work
    pub max_cas_attempts: u32,

    /// Price lookup timeout (milliseconds)
    pub price_timeout_ms: u64,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Currency catalog client configuration
    pub catalog: CatalogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet-ledger"),
            service_name: "wallet-ledger".to_string(),
            quote_asset: "USD".to_string(),
            minimal_unit: Decimal::new(1, 8),
            amount_scale: 8,
            price_scale: 12,
            max_cas_attempts: 3,
            price_timeout_ms: 2_000,
            rocksdb: RocksDBConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Row lock wait before a transaction gives up (milliseconds)
    pub lock_timeout_ms: i64,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            lock_timeout_ms: 1_000,
            enable_statistics: false,
        }
    }
}

/// Currency catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Base URL of the currency service
    pub base_url: String,

    /// HTTP request timeout (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5101".to_string(),
            request_timeout_ms: 1_500,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("WALLET_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(asset) = std::env::var("WALLET_LEDGER_QUOTE_ASSET") {
            config.quote_asset = asset;
        }

        if let Ok(unit) = std::env::var("WALLET_LEDGER_MINIMAL_UNIT") {
            config.minimal_unit = Decimal::from_str(&unit).map_err(|e| {
                crate::Error::Config(format!("Invalid WALLET_LEDGER_MINIMAL_UNIT: {}", e))
            })?;
        }

        if let Ok(attempts) = std::env::var("WALLET_LEDGER_MAX_CAS_ATTEMPTS") {
            config.max_cas_attempts = attempts.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid WALLET_LEDGER_MAX_CAS_ATTEMPTS: {}", e))
            })?;
        }

        if let Ok(timeout) = std::env::var("WALLET_LEDGER_PRICE_TIMEOUT_MS") {
            config.price_timeout_ms = timeout.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid WALLET_LEDGER_PRICE_TIMEOUT_MS: {}", e))
            })?;
        }

        if let Ok(url) = std::env::var("WALLET_LEDGER_CATALOG_URL") {
            config.catalog.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_cas_attempts == 0 {
            return Err(crate::Error::Config(
                "max_cas_attempts must be at least 1".to_string(),
            ));
        }
        if self.minimal_unit <= Decimal::ZERO {
            return Err(crate::Error::Config(
                "minimal_unit must be positive".to_string(),
            ));
        }
        if self.quote_asset.trim().is_empty() {
            return Err(crate::Error::Config("quote_asset is empty".to_string()));
        }
        if self.amount_scale > 18 || self.price_scale > 18 {
            return Err(crate::Error::Config(
                "amount_scale and price_scale must not exceed 18".to_string(),
            ));
        }
        if self.rocksdb.lock_timeout_ms <= 0 {
            return Err(crate::Error::Config(
                "rocksdb.lock_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Amount and price rules derived from [`Config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRules {
    /// Cash asset
    pub quote_asset: AssetSymbol,
    /// Smallest accepted amount
    pub minimal_unit: Decimal,
    /// Decimal places kept on amounts
    pub amount_scale: u32,
    /// Decimal places kept on prices
    pub price_scale: u32,
}

impl LedgerRules {
    /// Truncate an amount to the configured scale
    pub fn round_amount(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.amount_scale, RoundingStrategy::ToZero)
    }

    /// Round a price to the configured scale
    pub fn round_price(&self, price: Decimal) -> Decimal {
        price.round_dp_with_strategy(self.price_scale, RoundingStrategy::MidpointNearestEven)
    }

    /// Require a strictly positive amount of at least one minimal unit,
    /// with no more decimal places than the amount scale
    pub fn check_amount(&self, what: &str, amount: Decimal) -> crate::Result<()> {
        if amount <= Decimal::ZERO {
            return Err(crate::Error::Validation(format!(
                "{} must be positive, got {}",
                what, amount
            )));
        }
        if self.round_amount(amount) != amount {
            return Err(crate::Error::Validation(format!(
                "{} {} has more than {} decimal places",
                what, amount, self.amount_scale
            )));
        }
        if amount < self.minimal_unit {
            return Err(crate::Error::Validation(format!(
                "{} {} is below the minimal unit {}",
                what, amount, self.minimal_unit
            )));
        }
        Ok(())
    }

    /// Require a fee that is zero or positive
    pub fn check_fee(&self, fee: Decimal) -> crate::Result<()> {
        if fee < Decimal::ZERO {
            return Err(crate::Error::Validation(format!(
                "Fee must not be negative, got {}",
                fee
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Amount rules for this configuration
    pub fn rules(&self) -> crate::Result<LedgerRules> {
        self.validate()?;
        Ok(LedgerRules {
            quote_asset: AssetSymbol::new(&self.quote_asset)
                .map_err(|e| crate::Error::Config(format!("Invalid quote_asset: {}", e)))?,
            minimal_unit: self.minimal_unit,
            amount_scale: self.amount_scale,
            price_scale: self.price_scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "wallet-ledger");
        assert_eq!(config.quote_asset, "USD");
        assert_eq!(config.minimal_unit, Decimal::new(1, 8));
        assert_eq!(config.max_cas_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            quote_asset = "BRL"
            minimal_unit = "0.01"

            [rocksdb]
            lock_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.quote_asset, "BRL");
        assert_eq!(config.minimal_unit, Decimal::new(1, 2));
        assert_eq!(config.rocksdb.lock_timeout_ms, 250);
        assert_eq!(config.rocksdb.max_background_jobs, 4);
        assert_eq!(config.price_timeout_ms, 2_000);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = Config {
            max_cas_attempts: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_rules_rounding() {
        let rules = Config::default().rules().unwrap();
        assert_eq!(rules.quote_asset.as_str(), "USD");
        // Amounts truncate, never round up
        assert_eq!(
            rules.round_amount(Decimal::new(123456789999, 12)),
            Decimal::new(12345678, 8)
        );
        assert!(rules.check_amount("amount", Decimal::new(1, 9)).is_err());
        assert!(rules.check_amount("amount", Decimal::new(1, 8)).is_ok());
        assert!(rules.check_fee(Decimal::new(-1, 2)).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(&path, "service_name = \"wallet-ledger-test\"\nmax_cas_attempts = 5\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.service_name, "wallet-ledger-test");
        assert_eq!(config.max_cas_attempts, 5);
    }
}
