//! Backing store seam: FIFO lists plus a publish/subscribe channel.
//!
//! Workers lease a [`StoreConnection`] for one batch and drop it before parking. The
//! subscription controller holds one long-lived subscription through
//! [`BackingStore::subscribe`], which keeps calling back until told to unsubscribe.

mod engine;
mod error;
mod memory;
mod redis_backend;

use std::time::Duration;

pub use engine::{connect, StoreEngine};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use redis_backend::RedisStore;

pub trait StoreConnection: Send {
    fn push(&mut self, queue: &str, payload: &[u8]) -> Result<(), StoreError>;
    fn pop(&mut self, queue: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Waits up to `timeout` for an item; a zero timeout behaves like [`Self::pop`].
    fn pop_blocking(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, StoreError>;
    fn publish(&mut self, channel: &str, payload: &str) -> Result<(), StoreError>;
    fn len(&mut self, queue: &str) -> Result<u64, StoreError>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubscriptionEvent<'a> {
    Subscribed,
    Message { channel: &'a str, payload: &'a str },
    /// Nothing arrived within the poll interval.
    Idle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionFlow {
    Continue,
    Unsubscribe,
}

pub trait BackingStore: Send + Sync {
    fn lease(&self) -> Result<Box<dyn StoreConnection + '_>, StoreError>;

    /// Blocks the calling thread until `on_event` returns [`SubscriptionFlow::Unsubscribe`]
    /// (`Ok`) or the subscription connection fails (`Err`). `on_event` also receives
    /// [`SubscriptionEvent::Idle`] every `poll_interval` so callers can observe cancellation.
    fn subscribe(
        &self,
        channels: &[&str],
        poll_interval: Duration,
        on_event: &mut dyn FnMut(SubscriptionEvent<'_>) -> SubscriptionFlow,
    ) -> Result<(), StoreError>;

    fn describe(&self) -> String;
}
