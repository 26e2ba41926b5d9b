use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::OracleTick;
use crate::error::Result;

/// Anything that can cancel every resting order on the exchange.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderManager: Send + Sync {
    async fn cancel_all(&self) -> Result<()>;
}

/// Source of live oracle ticks, keyed by topic.
pub trait TickFeed: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<OracleTick>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_order_manager_records_calls() {
        let mut om = MockOrderManager::new();
        om.expect_cancel_all().times(1).returning(|| Ok(()));
        om.cancel_all().await.expect("cancel_all should succeed");
    }
}
