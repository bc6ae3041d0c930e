//! Durable event bus backends.
//!
//! The in-memory bus lives in `fakturenn-events`; this module hosts backends
//! with real persistence.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsEventBus};
