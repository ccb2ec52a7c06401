pub mod client;
pub mod config;
pub mod handler;
pub mod lifecycle;
pub mod logging;
pub mod message;
pub mod names;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use client::{ClientError, MqClient};
pub use handler::{HandlerOptions, HandlerResult};
pub use lifecycle::LifecycleState;
pub use message::Message;
pub use server::{MqServer, ServerError, ServerSettings, ServerStats};
