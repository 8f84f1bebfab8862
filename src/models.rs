// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Networks we track whale activity on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Solana,
    Bsc,
    Avalanche,
}

impl Chain {
    pub const ALL: [Chain; 4] = [Chain::Ethereum, Chain::Solana, Chain::Bsc, Chain::Avalanche];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Solana => "solana",
            Chain::Bsc => "bsc",
            Chain::Avalanche => "avalanche",
        }
    }

    /// Block explorer link for a transaction on this chain.
    pub fn explorer_tx_url(&self, tx_hash: &str) -> String {
        match self {
            Chain::Ethereum => format!("https://etherscan.io/tx/{}", tx_hash),
            Chain::Solana => format!("https://solscan.io/tx/{}", tx_hash),
            Chain::Bsc => format!("https://bscscan.com/tx/{}", tx_hash),
            Chain::Avalanche => format!("https://snowtrace.io/tx/{}", tx_hash),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown chain: {0}")]
pub struct ChainParseError(pub String);

impl FromStr for Chain {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" => Ok(Chain::Ethereum),
            "solana" | "sol" => Ok(Chain::Solana),
            "bsc" | "bnb" => Ok(Chain::Bsc),
            "avalanche" | "avax" => Ok(Chain::Avalanche),
            other => Err(ChainParseError(other.to_string())),
        }
    }
}

/// A raw on-chain transfer as delivered by a chain adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransfer {
    pub chain: Chain,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub token: String,
}

impl RawTransfer {
    pub fn key(&self) -> MovementKey {
        MovementKey {
            chain: self.chain,
            tx_hash: self.tx_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => f.write_str("buy"),
            Direction::Sell => f.write_str("sell"),
        }
    }
}

/// Natural key of a movement: (chain, tx_hash) is unique and is the
/// idempotency key for dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MovementKey {
    pub chain: Chain,
    pub tx_hash: String,
}

impl fmt::Display for MovementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.tx_hash)
    }
}

/// A classified whale transfer. Immutable once emitted: a price correction
/// produces a new record with the same key and a bumped version, never an
/// in-place edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleMovement {
    pub chain: Chain,
    pub amount: Decimal,
    pub usd_value: Decimal,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub token: String,
    pub direction: Direction,
    /// 0..=1
    pub confidence: Decimal,
    pub version: u32,
}

impl WhaleMovement {
    pub fn key(&self) -> MovementKey {
        MovementKey {
            chain: self.chain,
            tx_hash: self.tx_hash.clone(),
        }
    }
}

/// Why a transfer was dropped instead of classified. Every drop is logged
/// with the transfer key so the feed can be audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No usable price within the staleness window after bounded retries.
    Unclassified,
    /// Chain missing from the threshold table.
    UnsupportedChain,
    /// (chain, tx_hash) already processed.
    Duplicate,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Unclassified => f.write_str("Unclassified"),
            DropReason::UnsupportedChain => f.write_str("UnsupportedChain"),
            DropReason::Duplicate => f.write_str("Duplicate"),
        }
    }
}

/// A cluster of related movements, ready for gating and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEvent {
    pub chain: Chain,
    /// Earliest member timestamp.
    pub started_at: DateTime<Utc>,
    /// Exact sum of member usd_value; never recomputed from raw amounts.
    pub total_usd: Decimal,
    /// Majority of member directions; ties resolve to Sell.
    pub direction: Direction,
    pub token: String,
    /// Constituent movement keys, in arrival order, for audit.
    pub movements: Vec<MovementKey>,
}

impl AggregatedEvent {
    pub fn movement_count(&self) -> usize {
        self.movements.len()
    }
}

/// Per-period alert allowance for a tier. The config format uses -1 for
/// "unlimited"; inside the process that sentinel becomes an explicit variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertBudget {
    Unlimited,
    Limited(u32),
}

impl Serialize for AlertBudget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AlertBudget::Unlimited => serializer.serialize_i64(-1),
            AlertBudget::Limited(n) => serializer.serialize_i64(*n as i64),
        }
    }
}

impl<'de> Deserialize<'de> for AlertBudget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        if raw < 0 {
            Ok(AlertBudget::Unlimited)
        } else {
            u32::try_from(raw)
                .map(AlertBudget::Limited)
                .map_err(|_| {
                    serde::de::Error::custom(format!("alert budget {} out of range", raw))
                })
        }
    }
}

/// An alert recipient and their held token balance. Balances come from the
/// token-gating side (an external wallet lookup); here they are plain data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub balance: u64,
}

/// A named subscription level. Tiers are totally ordered by required_tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTier {
    pub name: String,
    pub required_tokens: u64,
    pub features: Vec<String>,
    pub max_alerts: AlertBudget,
    /// Minimum seconds between alert deliveries to a subscriber of this tier.
    pub refresh_rate_secs: u64,
}

impl AccessTier {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_parses_aliases_and_rejects_unknown() {
        assert_eq!("eth".parse::<Chain>().unwrap(), Chain::Ethereum);
        assert_eq!("Solana".parse::<Chain>().unwrap(), Chain::Solana);
        assert!("polygon".parse::<Chain>().is_err());
    }

    #[test]
    fn alert_budget_accepts_negative_sentinel() {
        let unlimited: AlertBudget = serde_json::from_str("-1").unwrap();
        assert_eq!(unlimited, AlertBudget::Unlimited);

        let capped: AlertBudget = serde_json::from_str("50").unwrap();
        assert_eq!(capped, AlertBudget::Limited(50));

        // Round-trips back to the sentinel at the config boundary.
        assert_eq!(serde_json::to_string(&AlertBudget::Unlimited).unwrap(), "-1");
    }

    #[test]
    fn alert_budget_rejects_oversized_values() {
        // u32::MAX + 1 must fail loudly, not wrap into a tiny budget.
        let result: Result<AlertBudget, _> = serde_json::from_str("4294967296");
        assert!(result.is_err());

        let max: AlertBudget = serde_json::from_str("4294967295").unwrap();
        assert_eq!(max, AlertBudget::Limited(u32::MAX));
    }

    #[test]
    fn tier_feature_lookup() {
        let tier = AccessTier {
            name: "Premium".into(),
            required_tokens: 1_000,
            features: vec!["instant_alerts".into(), "api_access".into()],
            max_alerts: AlertBudget::Limited(50),
            refresh_rate_secs: 60,
        };
        assert!(tier.has_feature("api_access"));
        assert!(!tier.has_feature("white_label"));
    }

    #[test]
    fn movement_key_display_is_chain_scoped() {
        let key = MovementKey {
            chain: Chain::Bsc,
            tx_hash: "0xabc".into(),
        };
        assert_eq!(key.to_string(), "bsc:0xabc");
    }
}
