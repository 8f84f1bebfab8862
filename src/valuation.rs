// src/valuation.rs
//
// USD valuation of token amounts at transfer time. The oracle is an external
// collaborator; everything here treats "no price", "stale price" and
// "transport error" the same way: the transfer stays unvalued and the
// classifier's retry policy takes over.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::warn;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration as StdDuration;

use crate::models::Chain;

/// A price answer with the moment it was observed, so callers can apply
/// their own staleness window against the transfer timestamp.
#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    pub price_usd: Decimal,
    pub quoted_at: DateTime<Utc>,
}

impl PriceQuote {
    /// True if the quote is within `staleness` of the transfer time,
    /// in either direction.
    pub fn is_fresh_for(&self, transfer_at: DateTime<Utc>, staleness: Duration) -> bool {
        let gap = if self.quoted_at > transfer_at {
            self.quoted_at - transfer_at
        } else {
            transfer_at - self.quoted_at
        };
        gap <= staleness
    }
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// USD price of one token unit on `chain` around `at`.
    /// `Ok(None)` means the oracle has no answer; transport failures are
    /// errors so the caller can distinguish them in logs.
    async fn price_at(
        &self,
        token: &str,
        chain: Chain,
        at: DateTime<Utc>,
    ) -> Result<Option<PriceQuote>>;
}

/// HTTP price oracle against a DexScreener-style endpoint.
pub struct HttpPriceOracle {
    client: Client,
    base_url: String,
}

impl HttpPriceOracle {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .user_agent("WhaleWatch/1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

// Price API response types
#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(rename = "priceUsd")]
    price_usd: Option<f64>,
    #[serde(rename = "updatedAt")]
    updated_at: Option<i64>,
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn price_at(
        &self,
        token: &str,
        chain: Chain,
        _at: DateTime<Utc>,
    ) -> Result<Option<PriceQuote>> {
        let url = format!("{}/price/{}/{}", self.base_url, chain, token);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("price API error: {}", response.status()));
        }

        let body: PriceResponse = response.json().await?;
        let Some(raw_price) = body.price_usd else {
            return Ok(None);
        };

        let price_usd = match Decimal::try_from(raw_price) {
            Ok(p) if p >= Decimal::ZERO => p,
            _ => {
                warn!("⚠️ Oracle returned unusable price {} for {}", raw_price, token);
                return Ok(None);
            }
        };

        let quoted_at = body
            .updated_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        Ok(Some(PriceQuote {
            price_usd,
            quoted_at,
        }))
    }
}

/// Fixed price table, always fresh. Used in tests and demos.
pub struct StaticPriceOracle {
    prices: HashMap<(Chain, String), Decimal>,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    pub fn with_price(mut self, chain: Chain, token: &str, price_usd: Decimal) -> Self {
        self.prices.insert((chain, token.to_string()), price_usd);
        self
    }
}

impl Default for StaticPriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn price_at(
        &self,
        token: &str,
        chain: Chain,
        at: DateTime<Utc>,
    ) -> Result<Option<PriceQuote>> {
        Ok(self
            .prices
            .get(&(chain, token.to_string()))
            .map(|price| PriceQuote {
                price_usd: *price,
                quoted_at: at,
            }))
    }
}
