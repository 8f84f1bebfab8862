// src/classifier.rs
//
// Turns raw transfers into classified whale movements: value the transfer in
// USD at transfer time, compare against the per-chain threshold, tag a
// direction via a pluggable heuristic, and score confidence. No side effects
// beyond the returned outcome; drop/retry policy belongs to the pipeline.

use chrono::Duration;
use log::debug;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use thiserror::Error;

use crate::config::ThresholdTable;
use crate::models::{Chain, Direction, MovementKey, RawTransfer, WhaleMovement};
use crate::valuation::PriceOracle;

#[derive(Debug)]
pub enum Classification {
    Whale(WhaleMovement),
    /// Valued fine, just below the threshold. Not an error.
    NotWhale,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    /// No usable price inside the staleness window. Retryable.
    #[error("no usable price for {key} within the staleness window")]
    ValuationUnavailable { key: MovementKey },
    /// Chain missing from the threshold table. Not retryable.
    #[error("no whale threshold configured for chain {0}")]
    UnsupportedChain(Chain),
}

impl ClassifyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClassifyError::ValuationUnavailable { .. })
    }
}

/// What a direction heuristic concluded about a transfer, and whether it
/// actually recognized an address or fell back to the conservative default.
#[derive(Debug, Clone, Copy)]
pub struct DirectionCall {
    pub direction: Direction,
    pub recognized: bool,
}

/// Direction tagging is business-specific and data-dependent, so it is a
/// replaceable policy rather than a hardcoded rule.
pub trait DirectionStrategy: Send + Sync {
    fn direction_of(&self, transfer: &RawTransfer) -> DirectionCall;
}

/// Default heuristic: a configurable book of known exchange hot wallets.
/// Outflow from an exchange is accumulation (Buy); everything else,
/// including deposits onto an exchange, reads as Sell. Exchange-internal
/// shuffles carry no signal and fall back to the unrecognized default.
pub struct ExchangeBookStrategy {
    book: HashMap<Chain, HashSet<String>>,
}

impl ExchangeBookStrategy {
    pub fn new(book: HashMap<Chain, HashSet<String>>) -> Self {
        Self { book }
    }

    fn is_exchange(&self, chain: Chain, address: &str) -> bool {
        self.book
            .get(&chain)
            .map(|addresses| addresses.contains(address))
            .unwrap_or(false)
    }
}

impl DirectionStrategy for ExchangeBookStrategy {
    fn direction_of(&self, transfer: &RawTransfer) -> DirectionCall {
        let from_exchange = self.is_exchange(transfer.chain, &transfer.from_address);
        let to_exchange = self.is_exchange(transfer.chain, &transfer.to_address);

        match (from_exchange, to_exchange) {
            (true, false) => DirectionCall {
                direction: Direction::Buy,
                recognized: true,
            },
            (false, true) => DirectionCall {
                direction: Direction::Sell,
                recognized: true,
            },
            // Neither address known, or an exchange-internal move:
            // conservative default.
            _ => DirectionCall {
                direction: Direction::Sell,
                recognized: false,
            },
        }
    }
}

pub struct WhaleClassifier {
    oracle: Arc<dyn PriceOracle>,
    direction: Arc<dyn DirectionStrategy>,
    /// Quotes farther than this from the transfer time are rejected.
    price_staleness: Duration,
    /// Bound on a single oracle call.
    io_timeout: StdDuration,
}

impl WhaleClassifier {
    pub fn new(
        oracle: Arc<dyn PriceOracle>,
        direction: Arc<dyn DirectionStrategy>,
        price_staleness: Duration,
        io_timeout: StdDuration,
    ) -> Self {
        Self {
            oracle,
            direction,
            price_staleness,
            io_timeout,
        }
    }

    /// Classify one raw transfer against the current threshold snapshot.
    pub async fn classify(
        &self,
        transfer: &RawTransfer,
        thresholds: &ThresholdTable,
    ) -> Result<Classification, ClassifyError> {
        let min_usd = thresholds
            .min_usd(transfer.chain)
            .ok_or(ClassifyError::UnsupportedChain(transfer.chain))?;

        let quote = tokio::time::timeout(
            self.io_timeout,
            self.oracle
                .price_at(&transfer.token, transfer.chain, transfer.timestamp),
        )
        .await
        .ok() // timeout
        .and_then(|result| result.ok()) // transport error
        .flatten() // oracle had no answer
        .filter(|q| q.is_fresh_for(transfer.timestamp, self.price_staleness))
        .ok_or_else(|| ClassifyError::ValuationUnavailable {
            key: transfer.key(),
        })?;

        let usd_value = transfer.amount * quote.price_usd;
        if usd_value < min_usd {
            debug!(
                "🤏 {} below threshold: {} < {}",
                transfer.key(),
                usd_value,
                min_usd
            );
            return Ok(Classification::NotWhale);
        }

        let call = self.direction.direction_of(transfer);
        let confidence = confidence_score(usd_value, min_usd, call.recognized);

        Ok(Classification::Whale(WhaleMovement {
            chain: transfer.chain,
            amount: transfer.amount,
            usd_value,
            timestamp: transfer.timestamp,
            tx_hash: transfer.tx_hash.clone(),
            from_address: transfer.from_address.clone(),
            to_address: transfer.to_address.clone(),
            token: transfer.token.clone(),
            direction: call.direction,
            confidence,
            version: 1,
        }))
    }
}

/// 0.9 base when the direction heuristic recognized an address, 0.5
/// otherwise, plus up to 0.1 for how far the value clears the threshold.
fn confidence_score(usd_value: Decimal, min_usd: Decimal, recognized: bool) -> Decimal {
    let base = if recognized {
        Decimal::new(9, 1)
    } else {
        Decimal::new(5, 1)
    };

    let excess = if min_usd > Decimal::ZERO {
        (usd_value / min_usd - Decimal::ONE).max(Decimal::ZERO)
    } else {
        Decimal::ZERO
    };
    let bonus = (excess * Decimal::new(1, 1)).min(Decimal::new(1, 1));

    (base + bonus).min(Decimal::ONE)
}
