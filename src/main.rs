// src/main.rs
use anyhow::Result;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

mod access;
mod adapters;
mod aggregator;
mod classifier;
mod config;
mod dispatch;
mod models;
mod pipeline;
mod utils;
mod valuation;

use adapters::ReplayAdapter;
use aggregator::{ExactAddressClustering, MovementAggregator};
use classifier::{ExchangeBookStrategy, WhaleClassifier};
use config::{AppConfig, Settings, Snapshot, ThresholdTable, TierTable};
use dispatch::{AlertDispatcher, LogDispatcher, WebhookDispatcher};
use models::{Chain, RawTransfer};
use pipeline::{ChainPipeline, PipelineContext};
use valuation::{HttpPriceOracle, PriceOracle, StaticPriceOracle};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();
    info!("🐋 Starting WhaleWatch");

    // Load configuration (defaults <- optional TOML <- WHALEWATCH_* env)
    let config_path = std::env::var("WHALEWATCH_CONFIG").ok();
    let app = Settings::load(config_path.as_deref())?.validate()?;
    info!(
        "✅ Configuration loaded: {} chain(s), {} tier(s), {} subscriber(s)",
        app.chains.len(),
        app.tiers.tiers().len(),
        app.subscribers.len()
    );
    if app.subscribers.is_empty() {
        warn!("⚠️ No subscribers configured; alerts will be gated away");
    }

    // Immutable table snapshots; an admin reload (SIGHUP) swaps them whole.
    let thresholds = Arc::new(Snapshot::new(app.thresholds.clone()));
    let tiers = Arc::new(Snapshot::new(app.tiers.clone()));
    let running = Arc::new(RwLock::new(true));

    let ctx = PipelineContext {
        thresholds: thresholds.clone(),
        tiers: tiers.clone(),
        running: running.clone(),
    };

    let oracle = build_oracle(&app)?;
    let dispatcher = build_dispatcher(&app)?;
    let direction = Arc::new(ExchangeBookStrategy::new(app.exchange_addresses.clone()));

    // Replay feed (if any), partitioned per chain.
    let mut feeds = load_transfer_feed(&app)?;

    // One independent pipeline per chain.
    let mut handles = vec![];
    for chain in &app.chains {
        let classifier = WhaleClassifier::new(
            oracle.clone(),
            direction.clone(),
            app.price_staleness,
            std::time::Duration::from_secs(app.io_timeout_secs),
        );
        let aggregator = MovementAggregator::new(
            *chain,
            app.aggregation_window,
            app.max_open_clusters,
            Arc::new(ExactAddressClustering),
        );
        let worker = ChainPipeline::new(
            *chain,
            classifier,
            aggregator,
            dispatcher.clone(),
            app.subscribers.clone(),
            app.valuation_retries,
        );

        let adapter = Box::new(ReplayAdapter::new(
            *chain,
            feeds.remove(chain).unwrap_or_default(),
        ));
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move { worker.run(adapter, ctx).await }));
    }

    // Admin reload: SIGHUP rebuilds both tables and swaps the snapshots.
    tokio::spawn(reload_on_sighup(
        config_path.clone(),
        thresholds.clone(),
        tiers.clone(),
    ));

    // Ctrl-C lowers the running flag; pipelines drain and exit.
    tokio::spawn({
        let running = running.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 Shutdown requested; draining pipelines...");
                *running.write().await = false;
            }
        }
    });

    info!("🔥 All pipelines started");
    for handle in handles {
        match handle.await {
            Ok(Err(e)) => error!("Pipeline error: {}", e),
            Err(e) => error!("Pipeline panicked: {}", e),
            Ok(Ok(())) => {}
        }
    }

    info!("👋 WhaleWatch stopped");
    Ok(())
}

fn build_oracle(app: &AppConfig) -> Result<Arc<dyn PriceOracle>> {
    match &app.price_api_url {
        Some(url) => {
            info!("💱 Using price oracle at {}", url);
            Ok(Arc::new(HttpPriceOracle::new(url)?))
        }
        None => {
            warn!("⚠️ No price oracle configured; transfers will drop Unclassified");
            Ok(Arc::new(StaticPriceOracle::new()))
        }
    }
}

fn build_dispatcher(app: &AppConfig) -> Result<Arc<dyn AlertDispatcher>> {
    match &app.webhook_url {
        Some(url) => {
            info!("📤 Dispatching alerts to {}", url);
            Ok(Arc::new(WebhookDispatcher::new(url, app.dispatch_attempts)?))
        }
        None => {
            info!("📣 No webhook configured; alerts go to the log");
            Ok(Arc::new(LogDispatcher))
        }
    }
}

fn load_transfer_feed(app: &AppConfig) -> Result<HashMap<Chain, Vec<RawTransfer>>> {
    let mut feeds: HashMap<Chain, Vec<RawTransfer>> = HashMap::new();
    let Some(path) = &app.transfer_feed else {
        return Ok(feeds);
    };

    let raw = std::fs::read_to_string(path)?;
    let transfers: Vec<RawTransfer> = serde_json::from_str(&raw)?;
    info!("📼 Replaying {} transfers from {}", transfers.len(), path);

    for transfer in transfers {
        if !utils::is_plausible_address(transfer.chain, &transfer.from_address)
            || !utils::is_plausible_address(transfer.chain, &transfer.to_address)
        {
            warn!(
                "⚠️ Transfer {} has an implausible address for {}",
                transfer.key(),
                transfer.chain
            );
        }
        feeds.entry(transfer.chain).or_default().push(transfer);
    }
    Ok(feeds)
}

async fn reload_on_sighup(
    config_path: Option<String>,
    thresholds: Arc<Snapshot<ThresholdTable>>,
    tiers: Arc<Snapshot<TierTable>>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to install SIGHUP handler: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("🔄 Reloading threshold and tier tables...");
        match Settings::load(config_path.as_deref()).and_then(|s| Ok(s.validate()?)) {
            Ok(fresh) => {
                thresholds.swap(fresh.thresholds).await;
                tiers.swap(fresh.tiers).await;
                info!("✅ Tables reloaded");
            }
            Err(e) => {
                // Keep serving the previous snapshot on a bad reload.
                error!("❌ Reload failed, keeping current tables: {}", e);
            }
        }
    }
}
