//! In-process tick hub: publishers push oracle ticks, subscribers get a
//! broadcast receiver per topic.

use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::traits::TickFeed;
use crate::domain::OracleTick;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
pub struct BroadcastTickFeed {
    topics: RwLock<HashMap<String, broadcast::Sender<OracleTick>>>,
}

impl BroadcastTickFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<OracleTick> {
        if let Some(tx) = self
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
        {
            return tx.clone();
        }
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish a tick; returns the number of live subscribers that received it.
    pub fn publish(&self, topic: &str, tick: OracleTick) -> usize {
        let delivered = self.sender(topic).send(tick).unwrap_or(0);
        debug!(topic, delivered, "published oracle tick");
        delivered
    }
}

impl TickFeed for BroadcastTickFeed {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<OracleTick> {
        self.sender(topic).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_publish_reaches_topic_subscribers_only() {
        let feed = BroadcastTickFeed::new();
        let mut btc = feed.subscribe("btc");
        let mut eth = feed.subscribe("eth");

        let tick = OracleTick {
            symbol: "btc/usd".into(),
            price: dec!(65000),
            timestamp: Utc::now(),
        };
        assert_eq!(feed.publish("btc", tick.clone()), 1);

        assert_eq!(btc.recv().await.unwrap(), tick);
        assert!(eth.try_recv().is_err());
    }
}
