// src/aggregator.rs
//
// Clusters whale movements that look like one coordinated action: same
// wallet entity, close together in time, on one chain. Windows run on event
// time, so the same input sequence always closes the same clusters - that is
// what makes the output reproducible in tests.
//
// One aggregator instance per chain. Clusters never span chains, so chain
// pipelines stay lock-free with respect to each other.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::models::{AggregatedEvent, Chain, Direction, DropReason, MovementKey, WhaleMovement};

/// Decides whether two addresses belong to the same wallet entity.
/// Pluggable: entity resolution (label databases, cross-wallet heuristics)
/// swaps in here without touching the windowing logic.
pub trait WalletClusterStrategy: Send + Sync {
    fn same_entity(&self, a: &str, b: &str) -> bool;
}

/// Default: only an identical address is the same entity.
pub struct ExactAddressClustering;

impl WalletClusterStrategy for ExactAddressClustering {
    fn same_entity(&self, a: &str, b: &str) -> bool {
        a == b
    }
}

struct OpenCluster {
    /// Opening order; lower = opened earlier.
    id: u64,
    started_at: DateTime<Utc>,
    last_at: DateTime<Utc>,
    buys: usize,
    sells: usize,
    total_usd: Decimal,
    token: String,
    members: Vec<MovementKey>,
    addresses: HashSet<String>,
}

impl OpenCluster {
    fn accepts(
        &self,
        movement: &WhaleMovement,
        window: Duration,
        strategy: &dyn WalletClusterStrategy,
    ) -> bool {
        let gap = if movement.timestamp > self.last_at {
            movement.timestamp - self.last_at
        } else {
            self.last_at - movement.timestamp
        };
        if gap > window {
            return false;
        }

        self.addresses.iter().any(|known| {
            strategy.same_entity(known, &movement.from_address)
                || strategy.same_entity(known, &movement.to_address)
        })
    }

    fn admit(&mut self, movement: &WhaleMovement) {
        self.started_at = self.started_at.min(movement.timestamp);
        self.last_at = self.last_at.max(movement.timestamp);
        match movement.direction {
            Direction::Buy => self.buys += 1,
            Direction::Sell => self.sells += 1,
        }
        // Exact sum of classified values; raw amounts are never re-priced.
        self.total_usd += movement.usd_value;
        self.members.push(movement.key());
        self.addresses.insert(movement.from_address.clone());
        self.addresses.insert(movement.to_address.clone());
    }
}

pub struct MovementAggregator {
    chain: Chain,
    window: Duration,
    max_open_clusters: usize,
    strategy: Arc<dyn WalletClusterStrategy>,
    open: Vec<OpenCluster>,
    /// (chain, tx_hash) already admitted, with admission time for pruning.
    seen: HashMap<MovementKey, DateTime<Utc>>,
    next_id: u64,
}

impl MovementAggregator {
    pub fn new(
        chain: Chain,
        window: Duration,
        max_open_clusters: usize,
        strategy: Arc<dyn WalletClusterStrategy>,
    ) -> Self {
        Self {
            chain,
            window,
            max_open_clusters: max_open_clusters.max(1),
            strategy,
            open: Vec::new(),
            seen: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn open_cluster_count(&self) -> usize {
        self.open.len()
    }

    /// Feed one movement; returns any clusters this movement caused to close
    /// (window expiry or overflow force-close), in opening order.
    pub fn observe(&mut self, movement: &WhaleMovement) -> Vec<AggregatedEvent> {
        if movement.chain != self.chain {
            warn!(
                "🧭 {} aggregator ignoring movement from {}",
                self.chain, movement.chain
            );
            return Vec::new();
        }

        let key = movement.key();
        if self.seen.contains_key(&key) {
            info!("♻️ Dropped movement {} (reason: {})", key, DropReason::Duplicate);
            return Vec::new();
        }
        self.seen.insert(key, movement.timestamp);
        self.prune_seen(movement.timestamp);

        let mut closed = self.close_expired(movement.timestamp);

        // Most recently active qualifying cluster wins; ties go to the one
        // opened later. Keeps joins deterministic for a given sequence.
        let best = self
            .open
            .iter_mut()
            .filter(|c| c.accepts(movement, self.window, self.strategy.as_ref()))
            .max_by_key(|c| (c.last_at, c.id));

        if let Some(cluster) = best {
            debug!(
                "🧲 {} joined cluster #{} ({} members)",
                movement.key(),
                cluster.id,
                cluster.members.len() + 1
            );
            cluster.admit(movement);
            return closed;
        }

        if self.open.len() >= self.max_open_clusters {
            // Backpressure: bound memory under burst input. Only the
            // clustering opportunity is lost, not the movements themselves.
            let oldest = self.oldest_open_index();
            let forced = self.open.remove(oldest);
            warn!(
                "💥 Open-cluster cap {} hit on {}; force-closing cluster #{} ({} members)",
                self.max_open_clusters,
                self.chain,
                forced.id,
                forced.members.len()
            );
            closed.push(seal(forced));
        }

        let mut fresh = OpenCluster {
            id: self.next_id,
            started_at: movement.timestamp,
            last_at: movement.timestamp,
            buys: 0,
            sells: 0,
            total_usd: Decimal::ZERO,
            token: movement.token.clone(),
            members: Vec::new(),
            addresses: HashSet::new(),
        };
        self.next_id += 1;
        fresh.admit(movement);
        self.open.push(fresh);

        closed
    }

    /// Close every open cluster, in opening order. Used at end of batch and
    /// on shutdown; repeat calls are no-ops.
    pub fn flush(&mut self) -> Vec<AggregatedEvent> {
        let mut drained = std::mem::take(&mut self.open);
        drained.sort_by_key(|c| c.id);
        drained.into_iter().map(seal).collect()
    }

    fn close_expired(&mut self, now: DateTime<Utc>) -> Vec<AggregatedEvent> {
        let window = self.window;
        let mut expired: Vec<OpenCluster> = Vec::new();
        let mut kept: Vec<OpenCluster> = Vec::new();

        for cluster in self.open.drain(..) {
            if now > cluster.last_at && now - cluster.last_at > window {
                expired.push(cluster);
            } else {
                kept.push(cluster);
            }
        }
        self.open = kept;

        expired.sort_by_key(|c| c.id);
        expired.into_iter().map(seal).collect()
    }

    fn oldest_open_index(&self) -> usize {
        self.open
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.id)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    fn prune_seen(&mut self, now: DateTime<Utc>) {
        // Dedup memory only needs to cover the reorder bound; keep twice the
        // window and drop the rest.
        let horizon = self.window * 2;
        self.seen
            .retain(|_, admitted_at| now <= *admitted_at || now - *admitted_at <= horizon);
    }
}

fn seal(cluster: OpenCluster) -> AggregatedEvent {
    // Majority vote; an even split resolves to Sell. Conservative bias is
    // deliberate policy, matching the classifier's fallback.
    let direction = if cluster.buys > cluster.sells {
        Direction::Buy
    } else {
        Direction::Sell
    };

    AggregatedEvent {
        chain: cluster_chain(&cluster),
        started_at: cluster.started_at,
        total_usd: cluster.total_usd,
        direction,
        token: cluster.token,
        movements: cluster.members,
    }
}

fn cluster_chain(cluster: &OpenCluster) -> Chain {
    cluster
        .members
        .first()
        .map(|k| k.chain)
        .unwrap_or(Chain::Ethereum)
}
