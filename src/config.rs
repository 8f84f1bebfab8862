// src/config.rs
//
// Layered configuration: built-in defaults, then an optional TOML file,
// then WHALEWATCH_* environment overrides. The validated tables are handed
// out as immutable Arc snapshots; an admin reload builds a fresh snapshot
// and swaps the Arc, so concurrent readers never observe a half-updated
// table.

use anyhow::{Context, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{AccessTier, AlertBudget, Chain, Subscriber};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration names an unsupported chain: {0}")]
    UnknownChain(String),
    #[error("access tier table is empty")]
    NoTiers,
    #[error("tier {0:?} has zero refresh rate")]
    ZeroRefreshRate(String),
}

/// Raw on-disk/env shape. Validation turns this into [`AppConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// chain name -> minimum USD value to qualify as a whale
    #[serde(default = "default_thresholds")]
    pub thresholds: HashMap<String, Decimal>,

    #[serde(default = "default_tiers")]
    pub tiers: Vec<AccessTier>,

    /// Chains to run pipelines for.
    #[serde(default = "default_chains")]
    pub chains: Vec<String>,

    /// Known exchange hot-wallet addresses, per chain, for the default
    /// direction heuristic.
    #[serde(default)]
    pub exchange_addresses: HashMap<String, Vec<String>>,

    #[serde(default = "default_aggregation_window_secs")]
    pub aggregation_window_secs: u64,

    #[serde(default = "default_max_open_clusters")]
    pub max_open_clusters: usize,

    /// Reject price quotes farther than this from the transfer time.
    #[serde(default = "default_price_staleness_secs")]
    pub price_staleness_secs: u64,

    /// Valuation retry attempts before a transfer is dropped Unclassified.
    #[serde(default = "default_valuation_retries")]
    pub valuation_retries: u32,

    /// Bound on any single oracle or dispatch call.
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,

    /// Where aggregated alerts get POSTed. None = log-only dispatch.
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_dispatch_attempts")]
    pub dispatch_attempts: u32,

    /// Price oracle endpoint. None = no oracle configured; every transfer
    /// will exhaust retries and drop Unclassified.
    #[serde(default)]
    pub price_api_url: Option<String>,

    /// Alert recipients with their gating-token balances.
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,

    /// Optional JSON file of raw transfers to replay through the pipelines
    /// (backfill/demo mode). Without it every pipeline sees an empty stream,
    /// drains, and the process exits.
    #[serde(default)]
    pub transfer_feed: Option<String>,
}

// Defaults match the tables the service launched with.
fn default_thresholds() -> HashMap<String, Decimal> {
    HashMap::from([
        ("ethereum".to_string(), Decimal::from(1_000_000)),
        ("solana".to_string(), Decimal::from(500_000)),
        ("bsc".to_string(), Decimal::from(300_000)),
        ("avalanche".to_string(), Decimal::from(200_000)),
    ])
}

fn default_tiers() -> Vec<AccessTier> {
    vec![
        AccessTier {
            name: "Basic".to_string(),
            required_tokens: 100,
            features: vec!["basic_alerts".into(), "standard_charts".into()],
            max_alerts: AlertBudget::Limited(5),
            refresh_rate_secs: 300,
        },
        AccessTier {
            name: "Premium".to_string(),
            required_tokens: 1_000,
            features: vec![
                "instant_alerts".into(),
                "advanced_analytics".into(),
                "api_access".into(),
            ],
            max_alerts: AlertBudget::Limited(50),
            refresh_rate_secs: 60,
        },
        AccessTier {
            name: "Enterprise".to_string(),
            required_tokens: 10_000,
            features: vec![
                "custom_analytics".into(),
                "direct_api".into(),
                "white_label".into(),
            ],
            max_alerts: AlertBudget::Unlimited,
            refresh_rate_secs: 10,
        },
    ]
}

fn default_chains() -> Vec<String> {
    Chain::ALL.iter().map(|c| c.to_string()).collect()
}

fn default_aggregation_window_secs() -> u64 {
    600
}

fn default_max_open_clusters() -> usize {
    1_000
}

fn default_price_staleness_secs() -> u64 {
    300
}

fn default_valuation_retries() -> u32 {
    3
}

fn default_io_timeout_secs() -> u64 {
    10
}

fn default_dispatch_attempts() -> u32 {
    3
}

impl Settings {
    /// Load defaults, then `config_path` (if given), then env overrides like
    /// `WHALEWATCH_AGGREGATION_WINDOW_SECS=300`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder
            .add_source(config::Environment::with_prefix("WHALEWATCH").separator("__"));

        let raw = builder.build().context("failed to read configuration")?;
        let settings: Settings = raw
            .try_deserialize()
            .context("failed to parse configuration")?;

        Ok(settings)
    }

    pub fn validate(self) -> Result<AppConfig, ConfigError> {
        let mut thresholds = HashMap::new();
        for (name, min_usd) in &self.thresholds {
            let chain: Chain = name
                .parse()
                .map_err(|_| ConfigError::UnknownChain(name.clone()))?;
            thresholds.insert(chain, *min_usd);
        }

        let mut chains = Vec::new();
        for name in &self.chains {
            let chain: Chain = name
                .parse()
                .map_err(|_| ConfigError::UnknownChain(name.clone()))?;
            if !chains.contains(&chain) {
                chains.push(chain);
            }
        }

        if self.tiers.is_empty() {
            return Err(ConfigError::NoTiers);
        }
        for tier in &self.tiers {
            if tier.refresh_rate_secs == 0 {
                return Err(ConfigError::ZeroRefreshRate(tier.name.clone()));
            }
        }

        let mut exchange_addresses: HashMap<Chain, HashSet<String>> = HashMap::new();
        for (name, addresses) in &self.exchange_addresses {
            let chain: Chain = name
                .parse()
                .map_err(|_| ConfigError::UnknownChain(name.clone()))?;
            exchange_addresses
                .entry(chain)
                .or_default()
                .extend(addresses.iter().cloned());
        }

        Ok(AppConfig {
            chains,
            thresholds: ThresholdTable { inner: thresholds },
            tiers: TierTable::new(self.tiers),
            exchange_addresses,
            aggregation_window: Duration::seconds(self.aggregation_window_secs as i64),
            max_open_clusters: self.max_open_clusters,
            price_staleness: Duration::seconds(self.price_staleness_secs as i64),
            valuation_retries: self.valuation_retries,
            io_timeout_secs: self.io_timeout_secs,
            webhook_url: self.webhook_url,
            dispatch_attempts: self.dispatch_attempts,
            price_api_url: self.price_api_url,
            subscribers: self.subscribers,
            transfer_feed: self.transfer_feed,
        })
    }
}

/// Validated process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub chains: Vec<Chain>,
    pub thresholds: ThresholdTable,
    pub tiers: TierTable,
    pub exchange_addresses: HashMap<Chain, HashSet<String>>,
    pub aggregation_window: Duration,
    pub max_open_clusters: usize,
    pub price_staleness: Duration,
    pub valuation_retries: u32,
    pub io_timeout_secs: u64,
    pub webhook_url: Option<String>,
    pub dispatch_attempts: u32,
    pub price_api_url: Option<String>,
    pub subscribers: Vec<Subscriber>,
    pub transfer_feed: Option<String>,
}

/// chain -> minimum USD value to qualify as a whale. Read-only after load.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    inner: HashMap<Chain, Decimal>,
}

impl ThresholdTable {
    pub fn min_usd(&self, chain: Chain) -> Option<Decimal> {
        self.inner.get(&chain).copied()
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(Chain, i64)]) -> Self {
        Self {
            inner: pairs.iter().map(|(c, v)| (*c, Decimal::from(*v))).collect(),
        }
    }
}

/// Access tiers sorted ascending by required_tokens.
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: Vec<AccessTier>,
}

impl TierTable {
    pub fn new(mut tiers: Vec<AccessTier>) -> Self {
        tiers.sort_by_key(|t| t.required_tokens);
        Self { tiers }
    }

    pub fn tiers(&self) -> &[AccessTier] {
        &self.tiers
    }
}

/// A table snapshot readers clone an Arc of. Reload builds a whole new value
/// and swaps it in; in-place mutation is not offered.
pub struct Snapshot<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub async fn get(&self) -> Arc<T> {
        self.inner.read().await.clone()
    }

    pub async fn swap(&self, next: T) {
        *self.inner.write().await = Arc::new(next);
    }
}
