use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{BackingStore, StoreConnection, StoreError, SubscriptionEvent, SubscriptionFlow};

struct Subscriber {
    id: u64,
    channels: Vec<String>,
    sender: Sender<(String, String)>,
}

/// In-process store with the same FIFO and pub/sub semantics as the Redis backend.
///
/// [`MemoryStore::set_offline`] simulates losing connectivity: new leases fail, blocked
/// pops return an error and live subscriptions end with [`StoreError::ConnectionLost`].
#[derive(Default)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    list_ready: Condvar,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
    offline: AtomicBool,
    active_leases: AtomicU64,
    published: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        let _guard = self.lock_lists();
        self.list_ready.notify_all();
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn active_leases(&self) -> u64 {
        self.active_leases.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn list_len(&self, queue: &str) -> usize {
        self.lock_lists().get(queue).map_or(0, VecDeque::len)
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.is_offline() {
            return Err(StoreError::Unavailable {
                reason: "memory store is offline".to_owned(),
            });
        }
        Ok(())
    }

    fn lock_lists(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Vec<u8>>>> {
        self.lists
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, queue: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.ensure_online()?;
        self.lock_lists()
            .entry(queue.to_owned())
            .or_default()
            .push_back(payload.to_vec());
        self.list_ready.notify_all();
        Ok(())
    }

    fn pop_until(
        &self,
        queue: &str,
        deadline: Option<Instant>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let mut lists = self.lock_lists();
        loop {
            self.ensure_online()?;
            if let Some(item) = lists.get_mut(queue).and_then(VecDeque::pop_front) {
                return Ok(Some(item));
            }
            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            lists = self
                .list_ready
                .wait_timeout(lists, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.ensure_online()?;
        self.published.fetch_add(1, Ordering::SeqCst);
        self.lock_subscribers().retain(|subscriber| {
            if !subscriber.channels.iter().any(|name| name == channel) {
                return true;
            }
            subscriber
                .sender
                .send((channel.to_owned(), payload.to_owned()))
                .is_ok()
        });
        Ok(())
    }

    fn unregister(&self, subscriber_id: u64) {
        self.lock_subscribers()
            .retain(|subscriber| subscriber.id != subscriber_id);
    }
}

struct MemoryLease<'a> {
    store: &'a MemoryStore,
}

impl Drop for MemoryLease<'_> {
    fn drop(&mut self) {
        self.store.active_leases.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StoreConnection for MemoryLease<'_> {
    fn push(&mut self, queue: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.store.push(queue, payload)
    }

    fn pop(&mut self, queue: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.pop_until(queue, None)
    }

    fn pop_blocking(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        if timeout.is_zero() {
            return self.store.pop_until(queue, None);
        }
        self.store.pop_until(queue, Some(Instant::now() + timeout))
    }

    fn publish(&mut self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.store.publish(channel, payload)
    }

    fn len(&mut self, queue: &str) -> Result<u64, StoreError> {
        self.store.ensure_online()?;
        Ok(self.store.list_len(queue) as u64)
    }
}

impl BackingStore for MemoryStore {
    fn lease(&self) -> Result<Box<dyn StoreConnection + '_>, StoreError> {
        self.ensure_online()?;
        self.active_leases.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryLease { store: self }))
    }

    fn subscribe(
        &self,
        channels: &[&str],
        poll_interval: Duration,
        on_event: &mut dyn FnMut(SubscriptionEvent<'_>) -> SubscriptionFlow,
    ) -> Result<(), StoreError> {
        self.ensure_online()?;

        let (sender, receiver) = mpsc::channel::<(String, String)>();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.lock_subscribers().push(Subscriber {
            id,
            channels: channels.iter().map(|name| (*name).to_owned()).collect(),
            sender,
        });

        let mut flow = on_event(SubscriptionEvent::Subscribed);
        while flow == SubscriptionFlow::Continue {
            if self.is_offline() {
                self.unregister(id);
                return Err(StoreError::ConnectionLost {
                    reason: "memory store went offline during subscription".to_owned(),
                });
            }

            flow = match receiver.recv_timeout(poll_interval) {
                Ok((channel, payload)) => on_event(SubscriptionEvent::Message {
                    channel: &channel,
                    payload: &payload,
                }),
                Err(RecvTimeoutError::Timeout) => on_event(SubscriptionEvent::Idle),
                Err(RecvTimeoutError::Disconnected) => {
                    self.unregister(id);
                    return Err(StoreError::ConnectionLost {
                        reason: "subscription channel closed".to_owned(),
                    });
                }
            };
        }

        self.unregister(id);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::store::{BackingStore, StoreError, SubscriptionEvent, SubscriptionFlow};
    use crate::test_support::wait_until;

    use super::MemoryStore;

    #[test]
    fn pops_in_fifo_order() {
        let store = MemoryStore::new();
        let mut conn = store.lease().expect("lease should succeed");

        conn.push("mq:Incr.inq", b"one").expect("push should work");
        conn.push("mq:Incr.inq", b"two").expect("push should work");

        assert_eq!(conn.len("mq:Incr.inq").expect("len should work"), 2);
        assert_eq!(conn.pop("mq:Incr.inq").expect("pop should work"), Some(b"one".to_vec()));
        assert_eq!(conn.pop("mq:Incr.inq").expect("pop should work"), Some(b"two".to_vec()));
        assert_eq!(conn.pop("mq:Incr.inq").expect("pop should work"), None);
    }

    #[test]
    fn blocking_pop_wakes_on_push_from_another_thread() {
        let store = Arc::new(MemoryStore::new());
        let producer = Arc::clone(&store);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let mut conn = producer.lease().expect("lease should succeed");
            conn.push("mq:Ping.inq", b"late").expect("push should work");
        });

        let mut conn = store.lease().expect("lease should succeed");
        let started = Instant::now();
        let item = conn
            .pop_blocking("mq:Ping.inq", Duration::from_secs(2))
            .expect("blocking pop should work");
        handle.join().expect("producer should finish");

        assert_eq!(item, Some(b"late".to_vec()));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn blocking_pop_times_out_on_empty_queue() {
        let store = MemoryStore::new();
        let mut conn = store.lease().expect("lease should succeed");

        let item = conn
            .pop_blocking("mq:Empty.inq", Duration::from_millis(20))
            .expect("blocking pop should work");
        assert!(item.is_none());
    }

    #[test]
    fn leases_are_counted_and_released_on_drop() {
        let store = MemoryStore::new();
        {
            let _first = store.lease().expect("lease should succeed");
            let _second = store.lease().expect("lease should succeed");
            assert_eq!(store.active_leases(), 2);
        }
        assert_eq!(store.active_leases(), 0);
    }

    #[test]
    fn offline_store_refuses_leases() {
        let store = MemoryStore::new();
        store.set_offline(true);

        assert!(matches!(store.lease(), Err(StoreError::Unavailable { .. })));
        store.set_offline(false);
        assert!(store.lease().is_ok());
    }

    #[test]
    fn subscription_delivers_messages_until_unsubscribed() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::clone(&store);

        let handle = thread::spawn(move || {
            assert!(wait_until(Duration::from_secs(2), || publisher.subscriber_count() == 1));
            let mut conn = publisher.lease().expect("lease should succeed");
            conn.publish("mq:topic:in", "mq:Incr.inq").expect("publish should work");
            conn.publish("other", "ignored").expect("publish should work");
            conn.publish("mq:topic:in", "STOP").expect("publish should work");
        });

        let mut received = Vec::new();
        let result = store.subscribe(
            &["mq:topic:in"],
            Duration::from_millis(10),
            &mut |event| match event {
                SubscriptionEvent::Message { payload, .. } if payload == "STOP" => {
                    SubscriptionFlow::Unsubscribe
                }
                SubscriptionEvent::Message { payload, .. } => {
                    received.push(payload.to_owned());
                    SubscriptionFlow::Continue
                }
                _ => SubscriptionFlow::Continue,
            },
        );
        handle.join().expect("publisher should finish");

        assert!(result.is_ok());
        assert_eq!(received, vec!["mq:Incr.inq".to_owned()]);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn going_offline_breaks_live_subscription() {
        let store = Arc::new(MemoryStore::new());
        let switch = Arc::clone(&store);

        let handle = thread::spawn(move || {
            assert!(wait_until(Duration::from_secs(2), || switch.subscriber_count() == 1));
            switch.set_offline(true);
        });

        let result = store.subscribe(&["mq:topic:in"], Duration::from_millis(10), &mut |_| {
            SubscriptionFlow::Continue
        });
        handle.join().expect("switch thread should finish");

        assert!(matches!(result, Err(StoreError::ConnectionLost { .. })));
    }
}
