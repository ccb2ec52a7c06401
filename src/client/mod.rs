//! Producer side: enqueue messages and read back responses or dead letters.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::message::{CodecError, Message};
use crate::names::{QueueKind, QueueNames, TOPIC_IN};
use crate::store::{BackingStore, StoreError};

#[derive(Debug)]
pub enum ClientError {
    Store(StoreError),
    Codec(CodecError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(source) => write!(f, "client store operation failed: {source}"),
            Self::Codec(source) => write!(f, "client codec failure: {source}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<StoreError> for ClientError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<CodecError> for ClientError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

#[derive(Clone)]
pub struct MqClient {
    store: Arc<dyn BackingStore>,
}

impl MqClient {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    pub fn publish<T: Serialize>(&self, body: T) -> Result<Uuid, ClientError> {
        self.publish_message(&Message::new(body))
    }

    pub fn publish_priority<T: Serialize>(&self, body: T) -> Result<Uuid, ClientError> {
        self.publish_message(&Message::new(body).with_priority(1))
    }

    /// Pushes to the type's inbox (the priority inbox when `priority > 0`) and notifies the
    /// server on `mq:topic:in`.
    pub fn publish_message<T: Serialize>(&self, message: &Message<T>) -> Result<Uuid, ClientError> {
        let names = QueueNames::of::<T>();
        let kind = if message.priority > 0 {
            QueueKind::Priority
        } else {
            QueueKind::Normal
        };
        let queue_name = names.inbox(kind);
        let bytes = message.to_bytes()?;

        let mut connection = self.store.lease()?;
        connection.push(queue_name, &bytes)?;
        connection.publish(TOPIC_IN, queue_name)?;
        Ok(message.id)
    }

    /// Waits up to `timeout` for the next message on `queue_name`; a zero timeout does not
    /// block.
    pub fn pop_message<T: DeserializeOwned>(
        &self,
        queue_name: &str,
        timeout: Duration,
    ) -> Result<Option<Message<T>>, ClientError> {
        let mut connection = self.store.lease()?;
        let Some(bytes) = connection.pop_blocking(queue_name, timeout)? else {
            return Ok(None);
        };
        Ok(Some(Message::from_bytes(&bytes)?))
    }

    pub fn queue_len(&self, queue_name: &str) -> Result<u64, ClientError> {
        Ok(self.store.lease()?.len(queue_name)?)
    }
}

impl fmt::Debug for MqClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqClient")
            .field("store", &self.store.describe())
            .finish()
    }
}
