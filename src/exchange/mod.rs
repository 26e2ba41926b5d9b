pub mod feed;
mod traits;

pub use feed::BroadcastTickFeed;
#[cfg(test)]
pub use traits::MockOrderManager;
pub use traits::{OrderManager, TickFeed};
