//! Ledger reconciliation binary
//!
//! Usage: `wallet-ledger-audit [config.toml]`. Without a path the
//! configuration comes from `WALLET_LEDGER_*` environment variables.

use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};
use wallet_ledger::{AuditViolation, Config, HttpCatalog, WalletLedger};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("WALLET_LEDGER_LOG_JSON").is_ok_and(|v| v == "1" || v == "true") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => Config::from_env().context("Failed to load configuration from environment")?,
    };
    info!(data_dir = ?config.data_dir, "Starting ledger audit");

    let catalog = Arc::new(HttpCatalog::new(&config.catalog)?);
    let ledger = WalletLedger::open(config, catalog).context("Failed to open ledger")?;

    let report = ledger.audit()?;
    let stats = ledger.stats()?;
    info!(
        balances = stats.total_balances,
        lots = stats.total_lots,
        open_lots = stats.open_lots,
        entries = stats.total_entries,
        "Store statistics"
    );

    for violation in &report.violations {
        match violation {
            AuditViolation::DigestMismatch { entry_id } => {
                error!(entry_id = %entry_id, "Entry digest mismatch")
            }
            other => error!(violation = ?other, "Ledger invariant broken"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_clean() {
        anyhow::bail!("Audit found {} violation(s)", report.violations.len());
    }
    info!("Audit clean");
    Ok(())
}
