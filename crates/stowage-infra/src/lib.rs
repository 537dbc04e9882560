//! Stowage Infrastructure Library
//!
//! Shared infrastructure components used across the Stowage crates:
//! - Telemetry initialization
//! - Token-bucket rate limiting
//! - Single-flight request coalescing

#[cfg(feature = "observability-basic")]
pub mod telemetry;

#[cfg(feature = "rate-limit")]
pub mod rate_limit;

pub mod singleflight;

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry};

#[cfg(feature = "rate-limit")]
pub use rate_limit::TokenBucket;

pub use singleflight::SingleFlight;
