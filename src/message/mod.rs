use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope stored in every queue list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message<T> {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
    pub body: T,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageError {
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl<T> Message<T> {
    pub fn new(body: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            priority: 0,
            retry_attempts: 0,
            reply_to: None,
            error: None,
            body,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reply_to(mut self, queue_name: impl Into<String>) -> Self {
        self.reply_to = Some(queue_name.into());
        self
    }

    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.retry_attempts += 1;
        self.error = Some(MessageError {
            message: message.into(),
            failed_at: Utc::now(),
        });
    }
}

impl<T: Serialize> Message<T> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }
}

impl<T: DeserializeOwned> Message<T> {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[derive(Debug)]
pub enum CodecError {
    Encode(serde_json::Error),
    Decode(serde_json::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(source) => write!(f, "failed to encode message: {source}"),
            Self::Decode(source) => write!(f, "failed to decode message: {source}"),
        }
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{CodecError, Message};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Incr {
        value: i64,
    }

    #[test]
    fn failure_bumps_attempts_and_keeps_last_error() {
        let mut message = Message::new(Incr { value: 1 });
        message.record_failure("first");
        message.record_failure("second");

        assert_eq!(message.retry_attempts, 2);
        assert_eq!(
            message.error.as_ref().map(|error| error.message.as_str()),
            Some("second")
        );
    }

    #[test]
    fn decodes_minimal_envelope_with_defaults() {
        let raw = concat!(
            r#"{"id":"6f1c1a4e-3f4b-4d38-9d2b-0c7f6f0d7a11","#,
            r#""created_at":"2026-01-01T00:00:00Z","body":{"value":7}}"#
        )
        .as_bytes();

        let message = Message::<Incr>::from_bytes(raw).expect("minimal envelope should decode");
        assert_eq!(message.body, Incr { value: 7 });
        assert_eq!(message.priority, 0);
        assert_eq!(message.retry_attempts, 0);
        assert!(message.reply_to.is_none());
    }

    #[test]
    fn rejects_body_of_another_type() {
        let bytes = Message::new("not a counter".to_owned())
            .with_reply_to("mq:Incr.outq")
            .to_bytes()
            .expect("string body should encode");

        let result = Message::<Incr>::from_bytes(&bytes);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
