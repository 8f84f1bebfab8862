// src/adapters.rs
//
// Chain adapters feed the pipeline raw transfers. Real adapters (RPC or
// websocket subscriptions) live behind this trait; the pipeline only assumes
// a per-chain stream that is time-ordered up to a small reorder bound.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;

use crate::models::{Chain, RawTransfer};

#[async_trait]
pub trait ChainAdapter: Send {
    fn chain(&self) -> Chain;

    /// Next raw transfer, or None once the stream is closed.
    async fn next_transfer(&mut self) -> Result<Option<RawTransfer>>;
}

/// Replays a fixed set of transfers. Demo and test source.
pub struct ReplayAdapter {
    chain: Chain,
    queue: VecDeque<RawTransfer>,
}

impl ReplayAdapter {
    pub fn new(chain: Chain, transfers: Vec<RawTransfer>) -> Self {
        Self {
            chain,
            queue: transfers.into(),
        }
    }
}

#[async_trait]
impl ChainAdapter for ReplayAdapter {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn next_transfer(&mut self) -> Result<Option<RawTransfer>> {
        Ok(self.queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn replay_adapter_drains_in_order() {
        let transfers = vec![
            RawTransfer {
                chain: Chain::Ethereum,
                amount: Decimal::from(1),
                timestamp: DateTime::from_timestamp(100, 0).unwrap(),
                tx_hash: "0x01".into(),
                from_address: "0xaaa".into(),
                to_address: "0xbbb".into(),
                token: "WETH".into(),
            },
            RawTransfer {
                chain: Chain::Ethereum,
                amount: Decimal::from(2),
                timestamp: DateTime::from_timestamp(200, 0).unwrap(),
                tx_hash: "0x02".into(),
                from_address: "0xaaa".into(),
                to_address: "0xccc".into(),
                token: "WETH".into(),
            },
        ];

        let mut adapter = ReplayAdapter::new(Chain::Ethereum, transfers);
        assert_eq!(
            adapter.next_transfer().await.unwrap().unwrap().tx_hash,
            "0x01"
        );
        assert_eq!(
            adapter.next_transfer().await.unwrap().unwrap().tx_hash,
            "0x02"
        );
        assert!(adapter.next_transfer().await.unwrap().is_none());
    }
}
