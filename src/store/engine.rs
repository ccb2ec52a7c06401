use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};

use super::{BackingStore, MemoryStore, RedisStore, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreEngine {
    Redis,
    Memory,
}

impl StoreEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "redis" => Some(Self::Redis),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

pub fn connect(
    app_config: &AppConfig,
    logger: &Logger,
) -> Result<Arc<dyn BackingStore>, StoreError> {
    let Some(engine) = StoreEngine::parse(&app_config.store.engine) else {
        return Err(StoreError::UnsupportedEngine {
            engine: app_config.store.engine.clone(),
        });
    };

    let store: Arc<dyn BackingStore> = match engine {
        StoreEngine::Redis => Arc::new(RedisStore::open(
            &app_config.store.url,
            Duration::from_millis(app_config.store.connect_timeout_ms),
            app_config.store.max_idle_connections,
        )?),
        StoreEngine::Memory => Arc::new(MemoryStore::new()),
    };

    logger.log(
        LogLevel::Info,
        Some("store::init"),
        "Backing store initialized",
        Some(json!({
            "engine": engine.as_str(),
            "target": store.describe(),
            "connect_timeout_ms": app_config.store.connect_timeout_ms,
            "max_idle_connections": app_config.store.max_idle_connections,
        })),
    );

    Ok(store)
}
