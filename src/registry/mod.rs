//! Ticker universe discovery and registry synchronisation

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};

use crate::database::{Database, ProgressStore, SyncPlan, TickerRegistry};
use crate::models::{Config, Ticker};

pub mod sources;
pub use sources::{NasdaqTraderSource, SecEdgarSource};

/// A provider of the current list of exchange-listed securities
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_listing(&self) -> Result<Vec<Ticker>>;
}

/// Outcome of a registry sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Tickers in the filtered listing
    pub total: usize,
    pub new: usize,
    /// Listed tickers that were already known
    pub updated: usize,
    pub deactivated: usize,
    pub reactivated: usize,
}

const EXCLUDED_NAME_KEYWORDS: [&str; 4] = ["warrant", "unit", "right", "preferred"];

/// Keep common stocks only: no share classes, warrants, units, rights,
/// preferreds or test issues
pub fn is_common_stock(ticker: &Ticker) -> bool {
    let symbol = ticker.symbol.as_str();
    if symbol.is_empty() || symbol.len() > 5 || symbol.contains(['.', '$', '-']) {
        return false;
    }

    let name = ticker.name.as_deref().unwrap_or_default().to_lowercase();
    if EXCLUDED_NAME_KEYWORDS.iter().any(|kw| name.contains(kw)) {
        return false;
    }

    !name
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|word| word == "test")
}

pub fn filter_tickers(tickers: Vec<Ticker>) -> Vec<Ticker> {
    tickers.into_iter().filter(is_common_stock).collect()
}

/// Fetches the listing from a primary source with ordered fallbacks
pub struct TickerSync {
    sources: Vec<Box<dyn ListingSource>>,
}

impl TickerSync {
    pub fn new(sources: Vec<Box<dyn ListingSource>>) -> Self {
        Self { sources }
    }

    /// NASDAQ Trader first, SEC EDGAR as fallback
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(vec![
            Box::new(NasdaqTraderSource::new(config)?),
            Box::new(SecEdgarSource::new(config)?),
        ]))
    }

    /// Filtered listing from the first source that answers
    pub async fn fetch_listing(&self) -> Result<Vec<Ticker>> {
        let mut last_error = None;

        for source in &self.sources {
            match source.fetch_listing().await {
                Ok(tickers) => {
                    info!("📋 Fetched {} tickers from {}", tickers.len(), source.name());
                    return Ok(filter_tickers(tickers));
                }
                Err(e) => {
                    warn!("⚠️ {} listing failed, trying next source: {:#}", source.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("no listing sources configured")))
    }

    pub async fn sync(&self, db: &Database) -> Result<SyncStats> {
        let listing = self.fetch_listing().await?;
        sync_tickers(db, &listing).await
    }

    pub async fn detect_delistings(&self, db: &Database) -> Result<Vec<String>> {
        let listing = self.fetch_listing().await?;
        detect_delistings(db, &listing).await
    }
}

/// Reconcile the registry with `listing`.
///
/// New tickers get a `pending` progress row, tickers missing from the listing
/// are deactivated (their failure history is cleared), reappearing ones are
/// reactivated. An empty listing is treated as a source failure and changes
/// nothing.
pub async fn sync_tickers(db: &Database, listing: &[Ticker]) -> Result<SyncStats> {
    if listing.is_empty() {
        warn!("⚠️ Listing is empty, leaving the registry untouched");
        return Ok(SyncStats::default());
    }

    let listed: BTreeMap<&str, &Ticker> = listing.iter().map(|t| (t.symbol.as_str(), t)).collect();
    let existing: HashMap<String, Ticker> = db
        .list_tickers()
        .await?
        .into_iter()
        .map(|t| (t.symbol.clone(), t))
        .collect();

    let mut plan = SyncPlan::default();
    let mut stats = SyncStats {
        total: listed.len(),
        ..SyncStats::default()
    };

    for (symbol, ticker) in &listed {
        let mut ticker = (*ticker).clone();
        ticker.active = true;

        match existing.get(*symbol) {
            None => {
                stats.new += 1;
                plan.inserts.push(ticker);
            }
            Some(known) => {
                stats.updated += 1;
                if !known.active {
                    stats.reactivated += 1;
                }
                if !known.active {
                    plan.updates.push(ticker);
                } else {
                    plan.unchanged.push(symbol.to_string());
                }
            }
        }
    }

    for known in existing.values().filter(|t| t.active) {
        if listed.contains_key(known.symbol.as_str()) {
            continue;
        }
        plan.deactivations.push(known.symbol.clone());
        if let Some(mut record) = db.get(&known.symbol).await? {
            record.reset_for_registry_removal()?;
            plan.progress_resets.push(record);
        }
    }
    plan.deactivations.sort();
    stats.deactivated = plan.deactivations.len();

    db.apply_sync_plan(&plan, Utc::now()).await?;

    info!(
        "✅ Synced {} tickers: {} new, {} updated, {} deactivated, {} reactivated",
        stats.total, stats.new, stats.updated, stats.deactivated, stats.reactivated
    );
    Ok(stats)
}

/// Active registry tickers absent from `listing`; read only
pub async fn detect_delistings(db: &Database, listing: &[Ticker]) -> Result<Vec<String>> {
    if listing.is_empty() {
        warn!("⚠️ Listing is empty, cannot detect delistings");
        return Ok(Vec::new());
    }

    let listed: HashSet<&str> = listing.iter().map(|t| t.symbol.as_str()).collect();
    let delisted: Vec<String> = db
        .list_active_tickers()
        .await?
        .into_iter()
        .map(|t| t.symbol)
        .filter(|symbol| !listed.contains(symbol.as_str()))
        .collect();

    if !delisted.is_empty() {
        info!("🔎 {} active tickers no longer listed", delisted.len());
    }
    Ok(delisted)
}
