use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{BackingStore, StoreConnection, StoreError, SubscriptionEvent, SubscriptionFlow};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Redis-backed store using the blocking client. Lists are pushed on the left and popped on
/// the right so every queue is FIFO.
pub struct RedisStore {
    client: redis::Client,
    idle: Mutex<Vec<redis::Connection>>,
    max_idle: usize,
    connect_timeout: Duration,
}

impl RedisStore {
    pub fn open(url: &str, connect_timeout: Duration, max_idle: usize) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
            max_idle,
            connect_timeout,
        })
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<redis::Connection>> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checkout(&self) -> Result<redis::Connection, StoreError> {
        if let Some(connection) = self.lock_idle().pop() {
            return Ok(connection);
        }
        self.client
            .get_connection_with_timeout(self.connect_timeout)
            .map_err(|source| StoreError::Unavailable {
                reason: source.to_string(),
            })
    }

    fn checkin(&self, connection: redis::Connection) {
        let mut idle = self.lock_idle();
        if idle.len() < self.max_idle {
            idle.push(connection);
        }
    }
}

struct RedisLease<'a> {
    store: &'a RedisStore,
    connection: Option<redis::Connection>,
    broken: bool,
}

impl RedisLease<'_> {
    fn run<T: redis::FromRedisValue>(&mut self, command: &redis::Cmd) -> Result<T, StoreError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(StoreError::ConnectionLost {
                reason: "lease already released".to_owned(),
            });
        };
        command.query(connection).map_err(|source| {
            let error = StoreError::Redis(source);
            if error.is_connection_fault() {
                self.broken = true;
            }
            error
        })
    }
}

impl Drop for RedisLease<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if !self.broken {
                self.store.checkin(connection);
            }
        }
    }
}

impl StoreConnection for RedisLease<'_> {
    fn push(&mut self, queue: &str, payload: &[u8]) -> Result<(), StoreError> {
        let _: i64 = self.run(redis::cmd("LPUSH").arg(queue).arg(payload))?;
        Ok(())
    }

    fn pop(&mut self, queue: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.run(redis::cmd("RPOP").arg(queue))
    }

    fn pop_blocking(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        // BRPOP with a zero timeout blocks forever.
        if timeout.is_zero() {
            return self.pop(queue);
        }
        let reply: Option<(String, Vec<u8>)> =
            self.run(redis::cmd("BRPOP").arg(queue).arg(timeout.as_secs_f64()))?;
        Ok(reply.map(|(_, payload)| payload))
    }

    fn publish(&mut self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let _: i64 = self.run(redis::cmd("PUBLISH").arg(channel).arg(payload))?;
        Ok(())
    }

    fn len(&mut self, queue: &str) -> Result<u64, StoreError> {
        self.run(redis::cmd("LLEN").arg(queue))
    }
}

/// Non-UTF-8 payloads decode lossily; they can never name a queue and are ignored downstream.
fn payload_text(message: &redis::Msg) -> String {
    String::from_utf8_lossy(message.get_payload_bytes()).into_owned()
}

impl BackingStore for RedisStore {
    fn lease(&self) -> Result<Box<dyn StoreConnection + '_>, StoreError> {
        let connection = self.checkout()?;
        Ok(Box::new(RedisLease {
            store: self,
            connection: Some(connection),
            broken: false,
        }))
    }

    fn subscribe(
        &self,
        channels: &[&str],
        poll_interval: Duration,
        on_event: &mut dyn FnMut(SubscriptionEvent<'_>) -> SubscriptionFlow,
    ) -> Result<(), StoreError> {
        // Subscriptions never go back to the idle cache; the connection is dedicated.
        let mut connection = self
            .client
            .get_connection_with_timeout(self.connect_timeout)
            .map_err(|source| StoreError::Unavailable {
                reason: source.to_string(),
            })?;
        let mut pubsub = connection.as_pubsub();
        pubsub.set_read_timeout(Some(poll_interval.max(MIN_POLL_INTERVAL)))?;
        for channel in channels {
            pubsub.subscribe(*channel)?;
        }

        let mut flow = on_event(SubscriptionEvent::Subscribed);
        while flow == SubscriptionFlow::Continue {
            flow = match pubsub.get_message() {
                Ok(message) => {
                    let payload = payload_text(&message);
                    on_event(SubscriptionEvent::Message {
                        channel: message.get_channel_name(),
                        payload: &payload,
                    })
                }
                Err(source) if source.is_timeout() => on_event(SubscriptionEvent::Idle),
                Err(source) => {
                    return Err(StoreError::ConnectionLost {
                        reason: source.to_string(),
                    })
                }
            };
        }

        for channel in channels {
            pubsub.unsubscribe(*channel)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let info = self.client.get_connection_info();
        format!("redis://{}/{}", info.addr, info.redis.db)
    }
}

#[cfg(test)]
mod tests {
    use redis::{Msg, Value};

    use super::payload_text;

    fn published(payload: &[u8]) -> Msg {
        Msg::from_value(&Value::Array(vec![
            Value::BulkString(b"message".to_vec()),
            Value::BulkString(b"mq:topic:in".to_vec()),
            Value::BulkString(payload.to_vec()),
        ]))
        .expect("message frame should parse")
    }

    #[test]
    fn payload_text_keeps_queue_names() {
        assert_eq!(payload_text(&published(b"mq:Incr.inq")), "mq:Incr.inq");
    }

    #[test]
    fn payload_text_tolerates_invalid_utf8() {
        let text = payload_text(&published(&[0xff, b'q']));
        assert_eq!(text, "\u{FFFD}q");
    }
}
