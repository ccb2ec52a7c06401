use std::any::Any;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::message::Message;
use crate::names::{QueueKind, QueueNames, TOPIC_IN};
use crate::store::StoreConnection;

use super::{
    HandlerError, HandlerErrorCallback, HandlerSettings, HandlerStats, MessageFailure,
    MessageHandler,
};

/// `Ok(Some(response))` publishes a response, `Ok(None)` just acknowledges, `Err` fails
/// the message and routes it through retry/dead-letter handling.
pub type HandlerResult<R> = Result<Option<R>, String>;

type ProcessFn<T, R> = Arc<dyn Fn(&Message<T>) -> HandlerResult<R> + Send + Sync>;

#[derive(Default)]
struct HandlerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    normal_received: AtomicU64,
    priority_received: AtomicU64,
    last_processed_at: Mutex<Option<DateTime<Utc>>>,
}

impl HandlerCounters {
    fn record_received(&self, kind: QueueKind) {
        match kind {
            QueueKind::Normal => self.normal_received.fetch_add(1, Ordering::Relaxed),
            QueueKind::Priority => self.priority_received.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        *self
            .last_processed_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());
    }
}

pub struct TypedHandler<T, R> {
    names: QueueNames,
    response_out_q: String,
    process: ProcessFn<T, R>,
    retry_count: u32,
    publish_responses: bool,
    pop_timeout: Duration,
    on_error: Option<HandlerErrorCallback>,
    counters: HandlerCounters,
    logger: Arc<Logger>,
    _types: PhantomData<fn() -> (T, R)>,
}

impl<T, R> TypedHandler<T, R>
where
    T: Serialize + DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    pub fn new(
        process: Arc<dyn Fn(&Message<T>) -> HandlerResult<R> + Send + Sync>,
        settings: &HandlerSettings,
        on_error: Option<HandlerErrorCallback>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            names: QueueNames::of::<T>(),
            response_out_q: QueueNames::of::<R>().out_q,
            process,
            retry_count: settings.retry_count,
            publish_responses: settings.publish_responses,
            pop_timeout: settings.pop_timeout,
            on_error,
            counters: HandlerCounters::default(),
            logger,
            _types: PhantomData,
        }
    }

    fn handle_raw(
        &self,
        connection: &mut dyn StoreConnection,
        queue_name: &str,
        raw: &[u8],
    ) -> Result<(), HandlerError> {
        let message = match Message::<T>::from_bytes(raw) {
            Ok(message) => message,
            Err(error) => {
                // Undecodable items can never succeed; park them without retrying.
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                connection.push(&self.names.dlq, raw)?;
                self.report_failure(MessageFailure {
                    message_type: self.names.message_type.clone(),
                    message_id: None,
                    queue_name: queue_name.to_owned(),
                    retry_attempts: 0,
                    reason: error.to_string(),
                    dead_lettered: true,
                });
                return Ok(());
            }
        };

        match catch_unwind(AssertUnwindSafe(|| (self.process)(&message))) {
            Ok(Ok(response)) => {
                self.counters.record_processed();
                if let Some(response) = response {
                    self.publish_response(connection, &message, response)?;
                }
                Ok(())
            }
            Ok(Err(reason)) => self.handle_failure(connection, queue_name, message, reason),
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                self.handle_failure(
                    connection,
                    queue_name,
                    message,
                    format!("handler panicked: {reason}"),
                )?;
                Err(HandlerError::Panicked {
                    message_type: self.names.message_type.clone(),
                    reason,
                })
            }
        }
    }

    fn handle_failure(
        &self,
        connection: &mut dyn StoreConnection,
        queue_name: &str,
        mut message: Message<T>,
        reason: String,
    ) -> Result<(), HandlerError> {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        message.record_failure(reason.clone());
        let dead_lettered = message.retry_attempts > self.retry_count;
        let bytes = message.to_bytes()?;

        if dead_lettered {
            connection.push(&self.names.dlq, &bytes)?;
        } else {
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            // Retries stay in the lane the message was taken from.
            let kind = self.names.kind_of(queue_name).unwrap_or(QueueKind::Normal);
            let inbox = self.names.inbox(kind);
            connection.push(inbox, &bytes)?;
            connection.publish(TOPIC_IN, inbox)?;
        }

        self.report_failure(MessageFailure {
            message_type: self.names.message_type.clone(),
            message_id: Some(message.id),
            queue_name: queue_name.to_owned(),
            retry_attempts: message.retry_attempts,
            reason,
            dead_lettered,
        });
        Ok(())
    }

    fn publish_response(
        &self,
        connection: &mut dyn StoreConnection,
        request: &Message<T>,
        body: R,
    ) -> Result<(), HandlerError> {
        let response = Message::new(body);
        let bytes = response.to_bytes()?;

        match request.reply_to.as_deref() {
            Some(reply_to) => {
                connection.push(reply_to, &bytes)?;
                connection.publish(TOPIC_IN, reply_to)?;
            }
            None if self.publish_responses => connection.push(&self.response_out_q, &bytes)?,
            None => {}
        }
        Ok(())
    }

    fn report_failure(&self, failure: MessageFailure) {
        self.logger.log(
            if failure.dead_lettered {
                LogLevel::Warn
            } else {
                LogLevel::Debug
            },
            Some("handler"),
            "Message handling failed",
            Some(json!({
                "message_type": failure.message_type,
                "message_id": failure.message_id.map(|id| id.to_string()),
                "queue": failure.queue_name,
                "retry_attempts": failure.retry_attempts,
                "dead_lettered": failure.dead_lettered,
                "reason": failure.reason,
            })),
        );

        if let Some(callback) = &self.on_error {
            callback(&failure);
        }
    }
}

impl<T, R> MessageHandler for TypedHandler<T, R>
where
    T: Serialize + DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    fn message_type(&self) -> &str {
        &self.names.message_type
    }

    fn process_queue(
        &self,
        connection: &mut dyn StoreConnection,
        queue_name: &str,
        keep_going: &dyn Fn() -> bool,
    ) -> Result<u64, HandlerError> {
        let kind = self.names.kind_of(queue_name).unwrap_or(QueueKind::Normal);
        let mut taken = 0;

        while keep_going() {
            let Some(raw) = connection.pop_blocking(queue_name, self.pop_timeout)? else {
                break;
            };
            taken += 1;
            self.counters.record_received(kind);
            self.handle_raw(connection, queue_name, &raw)?;
        }

        Ok(taken)
    }

    fn stats(&self) -> HandlerStats {
        HandlerStats {
            message_type: self.names.message_type.clone(),
            total_processed: self.counters.processed.load(Ordering::Relaxed),
            total_failed: self.counters.failed.load(Ordering::Relaxed),
            total_retries: self.counters.retries.load(Ordering::Relaxed),
            total_normal_received: self.counters.normal_received.load(Ordering::Relaxed),
            total_priority_received: self.counters.priority_received.load(Ordering::Relaxed),
            last_processed_at: *self
                .counters
                .last_processed_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        (*reason).to_owned()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
