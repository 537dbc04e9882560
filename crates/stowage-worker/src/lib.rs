//! Stowage Worker Library
//!
//! Drains pending upload jobs: bytes already cached on a local backend are
//! relayed to the tenant's destination backend by a bounded worker pool.

pub mod context;
pub mod queue;

pub use context::{RelayError, RelayHandler};
pub use queue::{RelayQueue, RelayQueueConfig, RelayWaker};
