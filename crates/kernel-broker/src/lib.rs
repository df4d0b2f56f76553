//! The Message I/O Adapter: a `Broker` trait plus a Redis-backed concrete
//! implementation and an in-process fake for tests.
//!
//! All adapter errors are fatal (§4.1) — this crate reports them, it never
//! retries or recovers from them. No ordering is guaranteed across queues;
//! the broker is at-least-once only.

use std::time::Duration;

use thiserror::Error;

pub mod fake;
pub mod redis_broker;

pub use fake::FakeBroker;
pub use redis_broker::RedisBroker;

/// One payload fetched from the broker, addressed for acking and tagged
/// with the queue it came from.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub queue: String,
    pub system_id: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("broker fetch failed: {0}")]
    Fetch(String),
    #[error("broker send failed: {0}")]
    Send(String),
}

/// The Message I/O Adapter contract (§4.1). Object-safe so the control loop
/// can hold a `Box<dyn Broker>` without knowing the concrete transport. Not
/// `Send`: the control loop is single-threaded end to end (§5) and never
/// moves the broker across a thread boundary.
pub trait Broker {
    /// Blocks up to `timeout` waiting for messages on `queue`. May return
    /// fewer than one (an empty vec on timeout, not an error).
    fn get_messages(&mut self, queue: &str, timeout: Duration) -> Result<Vec<RawMessage>, BrokerError>;

    /// Acknowledges a delivered payload, making redelivery unlikely. Durable
    /// brokers require this; an at-least-once pop-based broker (e.g. Redis
    /// `BRPOP`) may treat this as a no-op since the pop already removed the
    /// item (see `RedisBroker`).
    fn ack(&mut self, system_id: &str) -> Result<(), BrokerError>;

    /// Enqueues `payload` onto `queue`.
    fn send(&mut self, queue: &str, payload: &str) -> Result<(), BrokerError>;
}
