// src/dispatch.rs
//
// Alert delivery. The pipeline guarantees at-least-once hand-off to a
// dispatcher; retries past that point are the dispatcher's own business.
// Transport is deliberately open (webhook here, social post or push
// elsewhere) behind one trait.

use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::Client;
use std::time::Duration as StdDuration;
use thiserror::Error;

use crate::models::{AggregatedEvent, Direction, Subscriber};
use crate::utils::{format_usd, shorten_address};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("delivery to {subscriber} failed after {attempts} attempts: {last_error}")]
    Failed {
        subscriber: String,
        attempts: u32,
        last_error: String,
    },
}

#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    /// Deliver one aggregated event to one subscriber. Implementations own
    /// their retry policy; a returned error means delivery is abandoned.
    async fn deliver(
        &self,
        event: &AggregatedEvent,
        subscriber: &Subscriber,
    ) -> Result<(), DispatchError>;
}

/// Human-readable alert text, tweet-sized: direction marker, total value,
/// chain, token, constituent count and an explorer link to the first
/// transaction in the cluster.
pub fn format_alert(event: &AggregatedEvent) -> String {
    let marker = match event.direction {
        Direction::Buy => "🟢 BUY",
        Direction::Sell => "🔴 SELL",
    };

    let mut text = format!(
        "🐋 Whale {} on {}: {} of {}",
        marker,
        event.chain,
        format_usd(event.total_usd),
        event.token,
    );

    if event.movement_count() > 1 {
        text.push_str(&format!(" across {} transfers", event.movement_count()));
    }

    if let Some(first) = event.movements.first() {
        text.push_str(&format!(
            "\n🔗 {} ({})",
            event.chain.explorer_tx_url(&first.tx_hash),
            shorten_address(&first.tx_hash)
        ));
    }

    text
}

/// POSTs alerts as JSON to a configured endpoint, with bounded retries and
/// fixed backoff between attempts.
pub struct WebhookDispatcher {
    client: Client,
    url: String,
    max_attempts: u32,
    backoff: StdDuration,
}

impl WebhookDispatcher {
    pub fn new(url: &str, max_attempts: u32) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .user_agent("WhaleWatch/1.0")
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
            max_attempts: max_attempts.max(1),
            backoff: StdDuration::from_secs(2),
        })
    }
}

#[async_trait]
impl AlertDispatcher for WebhookDispatcher {
    async fn deliver(
        &self,
        event: &AggregatedEvent,
        subscriber: &Subscriber,
    ) -> Result<(), DispatchError> {
        let body = serde_json::json!({
            "subscriber": subscriber.id,
            "text": format_alert(event),
            "event": event,
        });

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.client.post(&self.url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        "📤 Delivered {} alert ({}) to {}",
                        event.chain,
                        format_usd(event.total_usd),
                        subscriber.id
                    );
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("webhook returned {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_attempts {
                warn!(
                    "🔁 Delivery attempt {}/{} to {} failed: {}",
                    attempt, self.max_attempts, subscriber.id, last_error
                );
                tokio::time::sleep(self.backoff).await;
            }
        }

        error!(
            "❌ Giving up on delivery to {} after {} attempts",
            subscriber.id, self.max_attempts
        );
        Err(DispatchError::Failed {
            subscriber: subscriber.id.clone(),
            attempts: self.max_attempts,
            last_error,
        })
    }
}

/// Logs alerts instead of sending them. Used when no webhook is configured.
pub struct LogDispatcher;

#[async_trait]
impl AlertDispatcher for LogDispatcher {
    async fn deliver(
        &self,
        event: &AggregatedEvent,
        subscriber: &Subscriber,
    ) -> Result<(), DispatchError> {
        info!("📣 [{}] {}", subscriber.id, format_alert(event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chain, MovementKey};
    use chrono::DateTime;
    use rust_decimal::Decimal;

    fn event() -> AggregatedEvent {
        AggregatedEvent {
            chain: Chain::Ethereum,
            started_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            total_usd: Decimal::from(2_000_000),
            direction: Direction::Sell,
            token: "WETH".into(),
            movements: vec![
                MovementKey {
                    chain: Chain::Ethereum,
                    tx_hash: "0x1234567890abcdef".into(),
                },
                MovementKey {
                    chain: Chain::Ethereum,
                    tx_hash: "0xfeedbeef".into(),
                },
            ],
        }
    }

    #[test]
    fn alert_text_carries_value_direction_and_link() {
        let text = format_alert(&event());
        assert!(text.contains("SELL"));
        assert!(text.contains("$2.00M"));
        assert!(text.contains("ethereum"));
        assert!(text.contains("across 2 transfers"));
        assert!(text.contains("https://etherscan.io/tx/0x1234567890abcdef"));
    }

    #[test]
    fn singleton_event_omits_transfer_count() {
        let mut single = event();
        single.movements.truncate(1);
        single.direction = Direction::Buy;
        let text = format_alert(&single);
        assert!(text.contains("BUY"));
        assert!(!text.contains("across"));
    }

    #[tokio::test]
    async fn log_dispatcher_always_hands_off() {
        let subscriber = Subscriber {
            id: "alice".into(),
            balance: 500,
        };
        assert!(LogDispatcher.deliver(&event(), &subscriber).await.is_ok());
    }
}
