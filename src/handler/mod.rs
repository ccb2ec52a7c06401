//! Handler contract consumed by workers.
//!
//! A handler owns everything that happens between popping a raw item and acknowledging
//! it: decoding, calling user code, retry/dead-letter routing and response publishing.
//! Errors returned from [`MessageHandler::process_queue`] are fatal to the calling worker.

mod typed;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::message::CodecError;
use crate::store::{StoreConnection, StoreError};

pub use typed::{HandlerResult, TypedHandler};

pub trait MessageHandler: Send + Sync {
    fn message_type(&self) -> &str;

    /// Drains `queue_name` while `keep_going` holds and the queue yields items. Returns the
    /// number of items taken off the queue.
    fn process_queue(
        &self,
        connection: &mut dyn StoreConnection,
        queue_name: &str,
        keep_going: &dyn Fn() -> bool,
    ) -> Result<u64, HandlerError>;

    fn stats(&self) -> HandlerStats;
}

/// Values every handler built from a registration shares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerSettings {
    pub retry_count: u32,
    pub publish_responses: bool,
    pub pop_timeout: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            retry_count: 2,
            publish_responses: true,
            pop_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageFailure {
    pub message_type: String,
    pub message_id: Option<Uuid>,
    pub queue_name: String,
    pub retry_attempts: u32,
    pub reason: String,
    pub dead_lettered: bool,
}

pub type HandlerErrorCallback = Arc<dyn Fn(&MessageFailure) + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// Overrides the server-wide retry count for this type.
    pub retry_count: Option<u32>,
    pub on_error: Option<HandlerErrorCallback>,
}

impl HandlerOptions {
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&MessageFailure) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("retry_count", &self.retry_count)
            .field("on_error", &self.on_error.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HandlerStats {
    pub message_type: String,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub total_normal_received: u64,
    pub total_priority_received: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl HandlerStats {
    pub fn merge(&mut self, other: &HandlerStats) {
        self.total_processed += other.total_processed;
        self.total_failed += other.total_failed;
        self.total_retries += other.total_retries;
        self.total_normal_received += other.total_normal_received;
        self.total_priority_received += other.total_priority_received;
        self.last_processed_at = self.last_processed_at.max(other.last_processed_at);
    }
}

#[derive(Debug)]
pub enum HandlerError {
    Store(StoreError),
    Codec(CodecError),
    Panicked { message_type: String, reason: String },
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(source) => write!(f, "handler store operation failed: {source}"),
            Self::Codec(source) => write!(f, "handler codec failure: {source}"),
            Self::Panicked {
                message_type,
                reason,
            } => write!(f, "handler for '{message_type}' panicked: {reason}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<StoreError> for HandlerError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<CodecError> for HandlerError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::HandlerStats;

    #[test]
    fn merge_sums_counters_and_keeps_latest_timestamp() {
        let earlier = Utc::now() - Duration::seconds(5);
        let later = Utc::now();
        let mut total = HandlerStats {
            message_type: "Incr".to_owned(),
            total_processed: 2,
            total_failed: 1,
            last_processed_at: Some(earlier),
            ..HandlerStats::default()
        };

        total.merge(&HandlerStats {
            message_type: "Incr".to_owned(),
            total_processed: 3,
            total_retries: 4,
            total_priority_received: 1,
            last_processed_at: Some(later),
            ..HandlerStats::default()
        });

        assert_eq!(total.total_processed, 5);
        assert_eq!(total.total_failed, 1);
        assert_eq!(total.total_retries, 4);
        assert_eq!(total.total_priority_received, 1);
        assert_eq!(total.last_processed_at, Some(later));
    }
}
