pub mod breaker;
pub mod intent;
pub mod lock;
pub mod position;
pub mod signal;

pub use breaker::*;
pub use intent::*;
pub use lock::*;
pub use position::*;
pub use signal::*;
