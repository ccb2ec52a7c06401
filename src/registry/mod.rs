use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::handler::{
    HandlerOptions, HandlerResult, HandlerSettings, MessageHandler, TypedHandler,
};
use crate::logging::Logger;
use crate::message::Message;
use crate::names::message_type_name;

/// Builds one handler instance per worker slot.
pub type HandlerFactory =
    Arc<dyn Fn(&HandlerSettings, &Arc<Logger>) -> Arc<dyn MessageHandler> + Send + Sync>;

#[derive(Clone)]
pub struct HandlerRegistration {
    pub message_type: String,
    factory: HandlerFactory,
}

impl HandlerRegistration {
    pub fn build(
        &self,
        settings: &HandlerSettings,
        logger: &Arc<Logger>,
    ) -> Arc<dyn MessageHandler> {
        (self.factory)(settings, logger)
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("message_type", &self.message_type)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateHandler { message_type: String },
    Sealed { message_type: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateHandler { message_type } => {
                write!(f, "a handler for '{message_type}' is already registered")
            }
            Self::Sealed { message_type } => write!(
                f,
                "cannot register '{message_type}': workers were already initialized"
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Ordered message type -> factory map. Sealed once the server builds its workers.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    registrations: Vec<HandlerRegistration>,
    sealed: bool,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, R, F>(
        &mut self,
        process: F,
        options: HandlerOptions,
    ) -> Result<(), RegistryError>
    where
        T: Serialize + DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&Message<T>) -> HandlerResult<R> + Send + Sync + 'static,
    {
        let process: Arc<dyn Fn(&Message<T>) -> HandlerResult<R> + Send + Sync> =
            Arc::new(process);
        let factory: HandlerFactory = Arc::new(
            move |settings: &HandlerSettings, logger: &Arc<Logger>| -> Arc<dyn MessageHandler> {
                let settings = HandlerSettings {
                    retry_count: options.retry_count.unwrap_or(settings.retry_count),
                    ..settings.clone()
                };
                Arc::new(TypedHandler::<T, R>::new(
                    Arc::clone(&process),
                    &settings,
                    options.on_error.clone(),
                    Arc::clone(logger),
                ))
            },
        );

        self.register_factory(message_type_name::<T>(), factory)
    }

    pub fn register_factory(
        &mut self,
        message_type: impl Into<String>,
        factory: HandlerFactory,
    ) -> Result<(), RegistryError> {
        let message_type = message_type.into();
        if self.sealed {
            return Err(RegistryError::Sealed { message_type });
        }
        if self.contains(&message_type) {
            return Err(RegistryError::DuplicateHandler { message_type });
        }

        self.registrations.push(HandlerRegistration {
            message_type,
            factory,
        });
        Ok(())
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.registrations
            .iter()
            .any(|registration| registration.message_type == message_type)
    }

    pub fn registrations(&self) -> &[HandlerRegistration] {
        &self.registrations
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }
}
