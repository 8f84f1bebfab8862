// src/pipeline.rs
//
// One pipeline per chain: adapter -> classifier -> aggregator -> gate ->
// dispatcher. Pipelines share nothing mutable; threshold and tier tables
// arrive as Arc snapshots. Shutdown drains: stop pulling, give queued
// retries a last pass, flush open clusters, deliver what closed.

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;

use crate::access::{AccessGate, GateDecision};
use crate::adapters::ChainAdapter;
use crate::aggregator::MovementAggregator;
use crate::classifier::{Classification, ClassifyError, WhaleClassifier};
use crate::config::{Snapshot, ThresholdTable, TierTable};
use crate::dispatch::AlertDispatcher;
use crate::models::{AggregatedEvent, Chain, DropReason, RawTransfer, Subscriber};
use crate::utils::format_usd;

/// Read-only process state every pipeline shares.
#[derive(Clone)]
pub struct PipelineContext {
    pub thresholds: Arc<Snapshot<ThresholdTable>>,
    pub tiers: Arc<Snapshot<TierTable>>,
    pub running: Arc<RwLock<bool>>,
}

pub struct ChainPipeline {
    chain: Chain,
    classifier: WhaleClassifier,
    aggregator: MovementAggregator,
    gate: AccessGate,
    dispatcher: Arc<dyn AlertDispatcher>,
    subscribers: Vec<Subscriber>,
    max_retries: u32,
    retry_queue: VecDeque<(RawTransfer, u32)>,
}

impl ChainPipeline {
    pub fn new(
        chain: Chain,
        classifier: WhaleClassifier,
        aggregator: MovementAggregator,
        dispatcher: Arc<dyn AlertDispatcher>,
        subscribers: Vec<Subscriber>,
        max_retries: u32,
    ) -> Self {
        Self {
            chain,
            classifier,
            aggregator,
            gate: AccessGate::new(),
            dispatcher,
            subscribers,
            max_retries,
            retry_queue: VecDeque::new(),
        }
    }

    pub async fn run(
        mut self,
        mut adapter: Box<dyn ChainAdapter>,
        ctx: PipelineContext,
    ) -> Result<()> {
        info!("🔍 Starting {} pipeline...", self.chain);

        loop {
            if !*ctx.running.read().await {
                info!("🛑 {} pipeline stopping...", self.chain);
                break;
            }

            let transfer = match adapter.next_transfer().await {
                Ok(Some(transfer)) => transfer,
                Ok(None) => {
                    info!("🏁 {} transfer stream ended", self.chain);
                    break;
                }
                Err(e) => {
                    error!("❌ {} adapter error: {}", self.chain, e);
                    tokio::time::sleep(StdDuration::from_secs(1)).await;
                    continue;
                }
            };

            self.ingest(transfer, 0, &ctx).await;
            self.drain_retries(&ctx).await;
        }

        self.shutdown(&ctx).await;
        Ok(())
    }

    /// Classify one transfer and feed the aggregator. `attempts` counts
    /// valuation retries already burned on this transfer.
    async fn ingest(&mut self, transfer: RawTransfer, attempts: u32, ctx: &PipelineContext) {
        let thresholds = ctx.thresholds.get().await;

        match self.classifier.classify(&transfer, &thresholds).await {
            Ok(Classification::Whale(movement)) => {
                info!(
                    "🐋 Whale movement {}: {} {} ({})",
                    movement.key(),
                    format_usd(movement.usd_value),
                    movement.direction,
                    movement.token
                );
                let closed = self.aggregator.observe(&movement);
                self.emit(closed, ctx).await;
            }
            Ok(Classification::NotWhale) => {}
            Err(e) if e.is_retryable() && attempts < self.max_retries => {
                debug!(
                    "🔁 Queueing {} for valuation retry {}/{}",
                    transfer.key(),
                    attempts + 1,
                    self.max_retries
                );
                self.retry_queue.push_back((transfer, attempts + 1));
            }
            Err(ClassifyError::ValuationUnavailable { key }) => {
                warn!(
                    "🗑️ Dropped {} (reason: {}) after {} retries",
                    key,
                    DropReason::Unclassified,
                    attempts
                );
            }
            Err(ClassifyError::UnsupportedChain(chain)) => {
                warn!(
                    "🗑️ Dropped {} (reason: {}, chain: {})",
                    transfer.key(),
                    DropReason::UnsupportedChain,
                    chain
                );
            }
        }
    }

    /// One retry pass over the queue. Entries that fail again with retries
    /// left re-queue themselves via ingest.
    async fn drain_retries(&mut self, ctx: &PipelineContext) {
        for _ in 0..self.retry_queue.len() {
            if let Some((transfer, attempts)) = self.retry_queue.pop_front() {
                self.ingest(transfer, attempts, ctx).await;
            }
        }
    }

    async fn emit(&mut self, events: Vec<AggregatedEvent>, ctx: &PipelineContext) {
        if events.is_empty() {
            return;
        }

        let tiers = ctx.tiers.get().await;
        for event in events {
            info!(
                "📦 Cluster closed on {}: {} {} across {} movement(s)",
                event.chain,
                format_usd(event.total_usd),
                event.direction,
                event.movement_count()
            );

            let now = Utc::now();
            for subscriber in &self.subscribers {
                match self
                    .gate
                    .permit(&subscriber.id, subscriber.balance, tiers.tiers(), now)
                {
                    GateDecision::Deliver => {
                        // Hand-off is at-least-once; the dispatcher owns any
                        // further retrying. A returned error is terminal.
                        if let Err(e) = self.dispatcher.deliver(&event, subscriber).await {
                            error!("❌ {}", e);
                        }
                    }
                    GateDecision::Suppressed(reason) => {
                        debug!("🔇 Suppressed alert for {}: {:?}", subscriber.id, reason);
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self, ctx: &PipelineContext) {
        // Last chance for queued valuations, then drop the rest.
        self.drain_retries(ctx).await;
        for (transfer, attempts) in std::mem::take(&mut self.retry_queue) {
            warn!(
                "🗑️ Dropped {} (reason: {}) at shutdown after {} retries",
                transfer.key(),
                DropReason::Unclassified,
                attempts
            );
        }

        let open = self.aggregator.flush();
        if !open.is_empty() {
            info!(
                "🧹 {} pipeline flushing {} open cluster(s)",
                self.chain,
                open.len()
            );
        }
        self.emit(open, ctx).await;
        info!("✅ {} pipeline drained", self.chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ReplayAdapter;
    use crate::aggregator::ExactAddressClustering;
    use crate::classifier::ExchangeBookStrategy;
    use crate::dispatch::DispatchError;
    use crate::valuation::StaticPriceOracle;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct RecordingDispatcher {
        delivered: Mutex<Vec<(String, AggregatedEvent)>>,
    }

    #[async_trait]
    impl AlertDispatcher for RecordingDispatcher {
        async fn deliver(
            &self,
            event: &AggregatedEvent,
            subscriber: &Subscriber,
        ) -> Result<(), DispatchError> {
            self.delivered
                .lock()
                .unwrap()
                .push((subscriber.id.clone(), event.clone()));
            Ok(())
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn transfer(tx: &str, secs: i64, amount: i64, from: &str, to: &str) -> RawTransfer {
        RawTransfer {
            chain: Chain::Ethereum,
            amount: Decimal::from(amount),
            timestamp: ts(secs),
            tx_hash: tx.into(),
            from_address: from.into(),
            to_address: to.into(),
            token: "WETH".into(),
        }
    }

    fn context() -> PipelineContext {
        PipelineContext {
            thresholds: Arc::new(Snapshot::new(ThresholdTable::from_pairs(&[(
                Chain::Ethereum,
                1_000_000,
            )]))),
            tiers: Arc::new(Snapshot::new(TierTable::new(vec![
                crate::models::AccessTier {
                    name: "Basic".into(),
                    required_tokens: 100,
                    features: vec![],
                    max_alerts: crate::models::AlertBudget::Limited(5),
                    refresh_rate_secs: 1,
                },
            ]))),
            running: Arc::new(RwLock::new(true)),
        }
    }

    fn pipeline(dispatcher: Arc<dyn AlertDispatcher>, subscribers: Vec<Subscriber>) -> ChainPipeline {
        let oracle = StaticPriceOracle::new().with_price(
            Chain::Ethereum,
            "WETH",
            Decimal::from(100_000),
        );
        let classifier = WhaleClassifier::new(
            Arc::new(oracle),
            Arc::new(ExchangeBookStrategy::new(HashMap::new())),
            Duration::minutes(5),
            StdDuration::from_secs(10),
        );
        let aggregator = MovementAggregator::new(
            Chain::Ethereum,
            Duration::minutes(10),
            1_000,
            Arc::new(ExactAddressClustering),
        );
        ChainPipeline::new(
            Chain::Ethereum,
            classifier,
            aggregator,
            dispatcher,
            subscribers,
            3,
        )
    }

    #[tokio::test]
    async fn end_to_end_burst_becomes_one_delivered_alert() {
        let dispatcher = Arc::new(RecordingDispatcher {
            delivered: Mutex::new(Vec::new()),
        });
        let subscribers = vec![
            Subscriber {
                id: "alice".into(),
                balance: 500,
            },
            Subscriber {
                id: "pleb".into(),
                balance: 10, // below every tier
            },
        ];

        // Two whale sells from one wallet 3 minutes apart, plus a shrimp
        // transfer that never qualifies.
        let feed = vec![
            transfer("0x01", 0, 12, "0xwhale", "0xex1"),   // $1.2M
            transfer("0x02", 180, 10, "0xwhale", "0xex2"), // $1.0M
            transfer("0x03", 200, 1, "0xshrimp", "0xex1"), // $100k, below line
        ];
        let adapter = Box::new(ReplayAdapter::new(Chain::Ethereum, feed));

        pipeline(dispatcher.clone(), subscribers)
            .run(adapter, context())
            .await
            .unwrap();

        let delivered = dispatcher.delivered.lock().unwrap();
        // One cluster, delivered to the authorized subscriber only.
        assert_eq!(delivered.len(), 1);
        let (who, event) = &delivered[0];
        assert_eq!(who, "alice");
        assert_eq!(event.total_usd, Decimal::from(2_200_000));
        assert_eq!(event.movement_count(), 2);
    }

    #[tokio::test]
    async fn unpriceable_transfers_drop_after_bounded_retries() {
        let dispatcher = Arc::new(RecordingDispatcher {
            delivered: Mutex::new(Vec::new()),
        });
        let subscribers = vec![Subscriber {
            id: "alice".into(),
            balance: 500,
        }];

        // Oracle knows WETH only; DOGE can never be valued.
        let feed = vec![RawTransfer {
            token: "DOGE".into(),
            ..transfer("0x01", 0, 1_000_000, "0xwhale", "0xex1")
        }];
        let adapter = Box::new(ReplayAdapter::new(Chain::Ethereum, feed));

        pipeline(dispatcher.clone(), subscribers)
            .run(adapter, context())
            .await
            .unwrap();

        // Dropped Unclassified; nothing delivered, pipeline stayed healthy.
        assert!(dispatcher.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_flag_stops_intake_but_flushes_clusters() {
        let dispatcher = Arc::new(RecordingDispatcher {
            delivered: Mutex::new(Vec::new()),
        });
        let subscribers = vec![Subscriber {
            id: "alice".into(),
            balance: 500,
        }];

        let ctx = context();
        // Flag already lowered: the pipeline must not pull any transfers,
        // and an empty flush delivers nothing.
        *ctx.running.write().await = false;

        let feed = vec![transfer("0x01", 0, 12, "0xwhale", "0xex1")];
        let adapter = Box::new(ReplayAdapter::new(Chain::Ethereum, feed));

        pipeline(dispatcher.clone(), subscribers)
            .run(adapter, ctx)
            .await
            .unwrap();

        assert!(dispatcher.delivered.lock().unwrap().is_empty());
    }
}
