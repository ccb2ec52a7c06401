use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    UnsupportedEngine { engine: String },
    Unavailable { reason: String },
    ConnectionLost { reason: String },
    Redis(redis::RedisError),
}

impl StoreError {
    /// Errors after which a pooled connection must not be reused.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::ConnectionLost { .. } => true,
            Self::Redis(source) => {
                source.is_io_error() || source.is_connection_dropped() || source.is_timeout()
            }
            Self::UnsupportedEngine { .. } => false,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported store.engine '{engine}'; allowed values: redis, memory"
            ),
            Self::Unavailable { reason } => write!(f, "backing store unavailable: {reason}"),
            Self::ConnectionLost { reason } => {
                write!(f, "backing store connection lost: {reason}")
            }
            Self::Redis(source) => write!(f, "redis error: {source}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(value: redis::RedisError) -> Self {
        Self::Redis(value)
    }
}
