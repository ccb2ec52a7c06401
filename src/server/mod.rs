//! Queue server: owns the worker array, the dispatch index and the subscription controller.
//!
//! Lifecycle transitions are CAS on [`StateCell`]; the controller thread finishes the
//! `Starting -> Started` move and is the only place that settles `Stopping -> Stopped`.
//! Workers that fail are replaced in place from their own error callback.

mod backoff;
mod controller;
mod metrics;

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::config::MqServerConfig;
use crate::handler::{HandlerOptions, HandlerResult, HandlerSettings, HandlerStats};
use crate::lifecycle::{LifecycleError, LifecycleState, StateCell};
use crate::logging::{LogLevel, Logger};
use crate::message::Message;
use crate::names::{QueueKind, QueueNames, STOP_COMMAND, TOPIC_IN};
use crate::registry::{HandlerRegistry, RegistryError};
use crate::store::{BackingStore, StoreError};
use crate::worker::{Worker, WorkerConfig, WorkerError, WorkerErrorCallback, WorkerStats};

pub use backoff::{backoff_delay, backoff_window, MAX_BACKOFF_MS};
pub use metrics::{MetricsSnapshot, RecordedError, ServerMetrics};

const LOG_CONTEXT: &str = "server::lifecycle";
const RECOVERY_CONTEXT: &str = "server::recovery";
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub type ServerErrorHandler = Arc<dyn Fn(&ServerError) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSettings {
    pub retry_count: u32,
    pub disable_priority_queues: bool,
    /// Types that get a priority worker; empty means every type.
    pub priority_queue_whitelist: Vec<String>,
    pub publish_responses: bool,
    pub pop_timeout: Duration,
    pub subscription_poll: Duration,
    pub worker_stop_grace: Duration,
    pub dispose_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from(&MqServerConfig::default())
    }
}

impl From<&MqServerConfig> for ServerSettings {
    fn from(value: &MqServerConfig) -> Self {
        Self {
            retry_count: value.retry_count,
            disable_priority_queues: value.disable_priority_queues,
            priority_queue_whitelist: value.priority_queue_whitelist.clone(),
            publish_responses: value.publish_responses,
            pop_timeout: Duration::from_millis(value.pop_timeout_ms),
            subscription_poll: Duration::from_millis(value.subscription_poll_ms),
            worker_stop_grace: Duration::from_millis(value.worker_stop_grace_ms),
            dispose_timeout: Duration::from_millis(value.dispose_timeout_ms),
        }
    }
}

impl ServerSettings {
    fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            retry_count: self.retry_count,
            publish_responses: self.publish_responses,
            pop_timeout: self.pop_timeout,
        }
    }

    fn wants_priority_worker(&self, message_type: &str) -> bool {
        !self.disable_priority_queues
            && (self.priority_queue_whitelist.is_empty()
                || self
                    .priority_queue_whitelist
                    .iter()
                    .any(|allowed| allowed == message_type))
    }
}

#[derive(Debug)]
pub enum ServerError {
    Lifecycle(LifecycleError),
    Registry(RegistryError),
    Store(StoreError),
    Spawn(io::Error),
    Worker { queue_name: String, reason: String },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle(source) => write!(f, "{source}"),
            Self::Registry(source) => write!(f, "{source}"),
            Self::Store(source) => write!(f, "{source}"),
            Self::Spawn(source) => write!(f, "failed to spawn controller thread: {source}"),
            Self::Worker { queue_name, reason } => {
                write!(f, "worker for '{queue_name}' failed: {reason}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

impl From<LifecycleError> for ServerError {
    fn from(value: LifecycleError) -> Self {
        Self::Lifecycle(value)
    }
}

impl From<RegistryError> for ServerError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

impl From<StoreError> for ServerError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerStats {
    pub status: LifecycleState,
    pub store: String,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub handlers: Vec<HandlerStats>,
    pub workers: Vec<WorkerStats>,
}

pub struct MqServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    settings: ServerSettings,
    store: Arc<dyn BackingStore>,
    logger: Arc<Logger>,
    state: StateCell,
    registry: Mutex<HandlerRegistry>,
    workers: RwLock<Vec<Arc<Worker>>>,
    dispatch: OnceLock<HashMap<String, usize>>,
    controller: Mutex<Option<JoinHandle<()>>>,
    metrics: ServerMetrics,
    error_handler: RwLock<Option<ServerErrorHandler>>,
}

impl MqServer {
    pub fn new(
        store: Arc<dyn BackingStore>,
        logger: Arc<Logger>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                settings,
                store,
                logger,
                state: StateCell::new(LifecycleState::Stopped),
                registry: Mutex::new(HandlerRegistry::new()),
                workers: RwLock::new(Vec::new()),
                dispatch: OnceLock::new(),
                controller: Mutex::new(None),
                metrics: ServerMetrics::default(),
                error_handler: RwLock::new(None),
            }),
        }
    }

    pub fn register_handler<T, R, F>(&self, process: F) -> Result<(), ServerError>
    where
        T: Serialize + DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&Message<T>) -> HandlerResult<R> + Send + Sync + 'static,
    {
        self.register_handler_with(process, HandlerOptions::default())
    }

    pub fn register_handler_with<T, R, F>(
        &self,
        process: F,
        options: HandlerOptions,
    ) -> Result<(), ServerError>
    where
        T: Serialize + DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&Message<T>) -> HandlerResult<R> + Send + Sync + 'static,
    {
        self.inner.ensure_not_disposed()?;
        self.inner.lock_registry().register(process, options)?;
        Ok(())
    }

    pub fn set_error_handler(&self, handler: impl Fn(&ServerError) + Send + Sync + 'static) {
        *self
            .inner
            .error_handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(handler));
    }

    /// Builds workers and the dispatch index. Runs once handlers exist; later calls are no-ops.
    pub fn init(&self) {
        self.inner.init();
    }

    pub fn start(&self) -> Result<(), ServerError> {
        self.inner.start()
    }

    pub fn stop(&self) -> Result<(), ServerError> {
        self.inner.stop()
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state.load()
    }

    pub fn status(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count()
    }

    pub fn stats(&self) -> ServerStats {
        self.inner.stats()
    }

    pub fn stats_description(&self) -> String {
        describe_stats(&self.stats())
    }
}

impl Drop for MqServer {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl fmt::Debug for MqServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqServer")
            .field("state", &self.inner.state.load())
            .field("store", &self.inner.store.describe())
            .field("workers", &self.inner.worker_count())
            .finish()
    }
}

impl ServerInner {
    fn ensure_not_disposed(&self) -> Result<(), LifecycleError> {
        if self.state.is(LifecycleState::Disposed) {
            return Err(LifecycleError::Disposed {
                component: "server".to_owned(),
            });
        }
        Ok(())
    }

    fn init(self: &Arc<Self>) {
        let mut registry = self.lock_registry();
        // Stays open until a handler exists, so a no-handler start can be retried.
        if self.dispatch.get().is_some() || registry.is_empty() {
            return;
        }
        registry.seal();

        let handler_settings = self.settings.handler_settings();
        let weak = Arc::downgrade(self);
        let on_error: WorkerErrorCallback =
            Arc::new(move |worker: &Arc<Worker>, error: &WorkerError| {
                if let Some(inner) = weak.upgrade() {
                    inner.replace_worker(worker, error);
                }
            });

        let mut workers = Vec::new();
        for registration in registry.registrations() {
            let names = QueueNames::for_type(&registration.message_type);
            let mut kinds = vec![QueueKind::Normal];
            if self.settings.wants_priority_worker(&registration.message_type) {
                kinds.push(QueueKind::Priority);
            }
            for kind in kinds {
                workers.push(Worker::new(WorkerConfig {
                    queue_name: names.inbox(kind).to_owned(),
                    handler: registration.build(&handler_settings, &self.logger),
                    on_error: Some(Arc::clone(&on_error)),
                    store: Arc::clone(&self.store),
                    logger: Arc::clone(&self.logger),
                    stop_grace: self.settings.worker_stop_grace,
                    dispose_timeout: self.settings.dispose_timeout,
                }));
            }
        }

        let index: HashMap<String, usize> = workers
            .iter()
            .enumerate()
            .map(|(slot, worker)| (worker.queue_name().to_owned(), slot))
            .collect();
        let queues: Vec<&str> = workers.iter().map(|worker| worker.queue_name()).collect();
        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Workers initialized",
            Some(json!({
                "handlers": registry.len(),
                "workers": workers.len(),
                "queues": queues,
            })),
        );

        *self.write_workers() = workers;
        let _ = self.dispatch.set(index);
    }

    fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        match self.state.load() {
            LifecycleState::Disposed => {
                return Err(LifecycleError::Disposed {
                    component: "server".to_owned(),
                }
                .into())
            }
            LifecycleState::Started | LifecycleState::Starting => return Ok(()),
            LifecycleState::Stopping | LifecycleState::Stopped => {}
        }
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Ok(());
        }

        self.init();
        if self.worker_count() == 0 {
            self.logger.warn(
                Some(LOG_CONTEXT),
                "No handlers registered; nothing to start",
            );
            self.state
                .transition(LifecycleState::Starting, LifecycleState::Stopped);
            return Ok(());
        }

        // The previous controller may still be stopping workers after a STOP or a failure.
        self.join_controller(None);
        self.metrics.record_start();

        let workers: Vec<Arc<Worker>> = self.read_workers().clone();
        for worker in &workers {
            if let Err(error) = worker.start() {
                self.report(&ServerError::Worker {
                    queue_name: worker.queue_name().to_owned(),
                    reason: error.to_string(),
                });
            }
        }

        if self.state.is(LifecycleState::Disposed) {
            // dispose() raced this start and may have missed workers started above.
            let workers: Vec<Arc<Worker>> = self.read_workers().clone();
            for worker in workers {
                worker.dispose();
            }
            return Err(LifecycleError::Disposed {
                component: "server".to_owned(),
            }
            .into());
        }

        let continuous_errors = self.metrics.continuous_errors();
        let delay = backoff_delay(continuous_errors);
        if !delay.is_zero() {
            self.logger.log(
                LogLevel::Info,
                Some(LOG_CONTEXT),
                "Backing off before subscribing",
                Some(json!({
                    "continuous_errors": continuous_errors,
                    "delay_ms": delay.as_millis() as u64,
                })),
            );
            thread::sleep(delay);
        }

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("redmq-controller".to_owned())
            .spawn(move || controller::run(inner));
        match spawned {
            Ok(handle) => {
                *self.lock_controller() = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.state
                    .transition(LifecycleState::Starting, LifecycleState::Stopped);
                self.stop_workers();
                Err(ServerError::Spawn(source))
            }
        }
    }

    fn stop(&self) -> Result<(), ServerError> {
        self.ensure_not_disposed()?;
        if !self
            .state
            .transition(LifecycleState::Started, LifecycleState::Stopping)
        {
            return Ok(());
        }
        self.logger.debug(Some(LOG_CONTEXT), "Stopping server");

        let published = self
            .store
            .lease()
            .and_then(|mut connection| connection.publish(TOPIC_IN, STOP_COMMAND));
        if let Err(error) = published {
            // The controller notices Stopping on its next idle tick.
            self.logger.log(
                LogLevel::Warn,
                Some(LOG_CONTEXT),
                "Could not publish STOP",
                Some(json!({ "error": error.to_string() })),
            );
            self.report(&ServerError::Store(error));
        }
        Ok(())
    }

    fn dispose(&self) {
        if self.state.is(LifecycleState::Disposed) {
            return;
        }
        let _ = self.stop();
        if self.state.dispose() == LifecycleState::Disposed {
            return;
        }

        // Replacements only start while Started/Starting, so at most unstarted clones can
        // appear after the first pass.
        for _ in 0..2 {
            let workers: Vec<Arc<Worker>> = self.read_workers().clone();
            for worker in workers {
                worker.dispose();
            }
        }

        self.join_controller(Some(self.settings.dispose_timeout));
        self.logger.info(Some(LOG_CONTEXT), "Server disposed");
    }

    /// Joins the controller thread, waiting at most `timeout` when given and detaching it
    /// afterwards.
    fn join_controller(&self, timeout: Option<Duration>) {
        let Some(handle) = self.lock_controller().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }

        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL_INTERVAL);
            }
            if !handle.is_finished() {
                self.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    "Controller thread did not exit in time; detaching",
                    Some(json!({ "timeout_ms": timeout.as_millis() as u64 })),
                );
                return;
            }
        }

        if handle.join().is_err() {
            self.logger
                .error(Some(LOG_CONTEXT), "Controller thread panicked");
        }
    }

    fn stop_workers(&self) {
        let workers: Vec<Arc<Worker>> = self.read_workers().clone();
        for worker in workers {
            worker.stop();
        }
    }

    fn notify_queue(&self, queue_name: &str) {
        let worker = self
            .dispatch
            .get()
            .and_then(|index| index.get(queue_name))
            .and_then(|slot| self.read_workers().get(*slot).cloned());

        self.metrics.record_notification(worker.is_some());
        match worker {
            Some(worker) => worker.notify(),
            None => self.logger.log(
                LogLevel::Verbose,
                Some("server::controller"),
                "Ignoring notification for unknown queue",
                Some(json!({ "queue": queue_name })),
            ),
        }
    }

    /// Runs on the failed worker's thread. Swaps in a fresh clone at the same slot.
    fn replace_worker(&self, failed: &Arc<Worker>, error: &WorkerError) {
        let reason = error.to_string();
        let connectivity = error.is_connectivity();
        self.metrics.record_error(reason.clone(), connectivity);
        if connectivity {
            // Throttle restarts against a store that is down; runs before the slot is locked.
            thread::sleep(backoff_delay(self.metrics.continuous_errors()));
        }

        {
            let mut workers = self.write_workers();
            let Some(slot) = workers
                .iter()
                .position(|candidate| Arc::ptr_eq(candidate, failed))
            else {
                self.logger.log(
                    LogLevel::Warn,
                    Some(RECOVERY_CONTEXT),
                    "Failed worker is no longer installed",
                    Some(json!({ "queue": failed.queue_name() })),
                );
                return;
            };

            let fresh = failed.clone_fresh();
            workers[slot] = Arc::clone(&fresh);
            if matches!(
                self.state.load(),
                LifecycleState::Started | LifecycleState::Starting
            ) {
                if let Err(start_error) = fresh.start() {
                    self.logger.log(
                        LogLevel::Error,
                        Some(RECOVERY_CONTEXT),
                        "Replacement worker failed to start",
                        Some(json!({
                            "queue": fresh.queue_name(),
                            "error": start_error.to_string(),
                        })),
                    );
                }
            }
            failed.dispose();
            self.metrics.record_replacement();

            self.logger.log(
                LogLevel::Warn,
                Some(RECOVERY_CONTEXT),
                "Replaced failed worker",
                Some(json!({
                    "queue": failed.queue_name(),
                    "slot": slot,
                    "error": reason,
                    "restarted": fresh.state() != LifecycleState::Stopped,
                })),
            );
        }

        self.report(&ServerError::Worker {
            queue_name: failed.queue_name().to_owned(),
            reason,
        });
    }

    fn report(&self, error: &ServerError) {
        let handler = self
            .error_handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match handler {
            Some(handler) => handler(error),
            None => self
                .logger
                .error(Some(LOG_CONTEXT), &format!("Unhandled server error: {error}")),
        }
    }

    fn worker_count(&self) -> usize {
        self.read_workers().len()
    }

    fn stats(&self) -> ServerStats {
        let workers = self.read_workers();
        let worker_stats: Vec<WorkerStats> = workers.iter().map(|worker| worker.stats()).collect();
        drop(workers);

        let mut handlers: Vec<HandlerStats> = Vec::new();
        for stats in &worker_stats {
            match handlers
                .iter_mut()
                .find(|merged| merged.message_type == stats.handler.message_type)
            {
                Some(merged) => merged.merge(&stats.handler),
                None => handlers.push(stats.handler.clone()),
            }
        }

        ServerStats {
            status: self.state.load(),
            store: self.store.describe(),
            metrics: self.metrics.snapshot(),
            total_processed: handlers.iter().map(|stats| stats.total_processed).sum(),
            total_failed: handlers.iter().map(|stats| stats.total_failed).sum(),
            total_retries: handlers.iter().map(|stats| stats.total_retries).sum(),
            handlers,
            workers: worker_stats,
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, HandlerRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_controller(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.controller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_workers(&self) -> RwLockReadGuard<'_, Vec<Arc<Worker>>> {
        self.workers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_workers(&self) -> RwLockWriteGuard<'_, Vec<Arc<Worker>>> {
        self.workers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn describe_stats(stats: &ServerStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "STATUS: {}", stats.status);
    let _ = writeln!(out, "STORE: {}", stats.store);
    let _ = writeln!(out, "TIMES STARTED: {}", stats.metrics.times_started);
    let _ = writeln!(out, "TOTAL ERRORS: {}", stats.metrics.total_errors);
    let _ = writeln!(out, "CONTINUOUS ERRORS: {}", stats.metrics.continuous_errors);
    let _ = writeln!(out, "WORKERS REPLACED: {}", stats.metrics.workers_replaced);
    if let Some(last_error) = &stats.metrics.last_error {
        let _ = writeln!(out, "LAST ERROR: {} ({})", last_error.message, last_error.at);
    }
    let _ = writeln!(
        out,
        "MESSAGES: processed={} failed={} retries={}",
        stats.total_processed, stats.total_failed, stats.total_retries
    );
    for handler in &stats.handlers {
        let _ = writeln!(
            out,
            "  {}: processed={} failed={} retries={} normal={} priority={}",
            handler.message_type,
            handler.total_processed,
            handler.total_failed,
            handler.total_retries,
            handler.total_normal_received,
            handler.total_priority_received
        );
    }
    let _ = writeln!(out, "WORKERS: {}", stats.workers.len());
    for worker in &stats.workers {
        let _ = writeln!(
            out,
            "  {} [{}] notifications={} processed={}",
            worker.queue_name, worker.state, worker.notifications, worker.processed
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use crate::client::MqClient;
    use crate::handler::{HandlerOptions, HandlerResult};
    use crate::lifecycle::{LifecycleError, LifecycleState};
    use crate::logging::Logger;
    use crate::message::Message;
    use crate::names::{QueueNames, STOP_COMMAND, TOPIC_IN};
    use crate::registry::RegistryError;
    use crate::store::{BackingStore, MemoryStore};
    use crate::test_support::{capturing_logger, wait_until};

    use super::{MqServer, ServerError, ServerSettings};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Incr {
        value: i64,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        id: u32,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Pong {
        id: u32,
    }

    const SETTLE: Duration = Duration::from_secs(5);

    fn fast_settings() -> ServerSettings {
        ServerSettings {
            pop_timeout: Duration::from_millis(20),
            subscription_poll: Duration::from_millis(20),
            worker_stop_grace: Duration::from_millis(1),
            dispose_timeout: Duration::from_secs(2),
            ..ServerSettings::default()
        }
    }

    fn server_with(store: &Arc<MemoryStore>, settings: ServerSettings) -> MqServer {
        let store: Arc<dyn BackingStore> = store.clone();
        MqServer::new(store, Arc::new(Logger::discard()), settings)
    }

    fn server(store: &Arc<MemoryStore>) -> MqServer {
        server_with(store, fast_settings())
    }

    fn wait_for_state(server: &MqServer, state: LifecycleState) -> bool {
        wait_until(SETTLE, || server.state() == state)
    }

    #[test]
    fn incr_scenario_processes_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&seen);
        server
            .register_handler(move |message: &Message<Incr>| -> HandlerResult<Incr> {
                observed
                    .lock()
                    .expect("observed mutex poisoned")
                    .push(message.body.value);
                Ok(Some(Incr {
                    value: message.body.value + 1,
                }))
            })
            .expect("registration should succeed");

        let client = MqClient::new(store.clone());
        client
            .publish(Incr { value: 1 })
            .expect("publish should succeed");

        server.start().expect("start should succeed");
        assert!(wait_for_state(&server, LifecycleState::Started));
        assert!(wait_until(SETTLE, || server.stats().total_processed == 1));

        let response: Option<Message<Incr>> = client
            .pop_message(&QueueNames::of::<Incr>().out_q, Duration::from_millis(200))
            .expect("pop should succeed");
        assert_eq!(response.map(|message| message.body), Some(Incr { value: 2 }));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(*seen.lock().expect("observed mutex poisoned"), vec![1]);
        assert_eq!(server.stats().total_processed, 1);
        server.dispose();
    }

    #[test]
    fn published_while_running_reaches_worker_through_notification() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server
            .register_handler(|message: &Message<Ping>| -> HandlerResult<Pong> {
                Ok(Some(Pong {
                    id: message.body.id,
                }))
            })
            .expect("registration should succeed");
        server.start().expect("start should succeed");
        assert!(wait_for_state(&server, LifecycleState::Started));
        assert!(wait_until(SETTLE, || store.subscriber_count() == 1));

        let client = MqClient::new(store.clone());
        client.publish(Ping { id: 1 }).expect("publish should succeed");
        client
            .publish_priority(Ping { id: 2 })
            .expect("priority publish should succeed");

        let out_q = QueueNames::of::<Pong>().out_q;
        assert!(wait_until(SETTLE, || store.list_len(&out_q) == 2));
        let stats = server.stats();
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.handlers.len(), 1);
        assert_eq!(stats.handlers[0].total_normal_received, 1);
        assert_eq!(stats.handlers[0].total_priority_received, 1);
        assert!(wait_until(SETTLE, || server.stats().metrics.notifications >= 2));
        server.dispose();
    }

    #[test]
    fn always_panicking_handler_self_heals_within_retry_bound() {
        let store = Arc::new(MemoryStore::new());
        let settings = ServerSettings {
            retry_count: 1,
            ..fast_settings()
        };
        let server = server_with(&store, settings);
        let replacements = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&replacements);
        server.set_error_handler(move |error| {
            if matches!(error, ServerError::Worker { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> {
                panic!("handler always fails")
            })
            .expect("registration should succeed");

        let client = MqClient::new(store.clone());
        let published = 3;
        for value in 0..published {
            client.publish(Incr { value }).expect("publish should succeed");
        }
        server.start().expect("start should succeed");

        let dlq = QueueNames::of::<Incr>().dlq;
        assert!(wait_until(SETTLE, || store.list_len(&dlq) == published as usize));
        thread::sleep(Duration::from_millis(100));

        let restarts = server.stats().metrics.workers_replaced;
        // Every attempt kills a worker; each message is attempted retry_count + 1 times.
        assert!(restarts >= published as u64, "only {restarts} restarts");
        assert!(restarts <= published as u64 * 2, "{restarts} restarts");
        assert_eq!(replacements.load(Ordering::SeqCst) as u64, restarts);
        assert_eq!(server.state(), LifecycleState::Started);
        server.dispose();
    }

    #[test]
    fn start_without_handlers_reverts_to_stopped() {
        let store = Arc::new(MemoryStore::new());
        let (logger, sink) = capturing_logger();
        let backing: Arc<dyn BackingStore> = store.clone();
        let server = MqServer::new(backing, logger, fast_settings());

        server.start().expect("start should be a silent no-op");

        assert_eq!(server.state(), LifecycleState::Stopped);
        assert_eq!(server.worker_count(), 0);
        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(server.stats().metrics.times_started, 0);
        assert!(sink.contains("No handlers registered"));
    }

    #[test]
    fn registration_stays_open_after_start_without_handlers() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server.start().expect("start should be a silent no-op");
        assert_eq!(server.state(), LifecycleState::Stopped);

        server
            .register_handler(|message: &Message<Incr>| -> HandlerResult<Incr> {
                Ok(Some(Incr {
                    value: message.body.value + 1,
                }))
            })
            .expect("registration should still be open");
        server.start().expect("second start should succeed");

        assert!(wait_for_state(&server, LifecycleState::Started));
        assert_eq!(server.worker_count(), 2);
        assert!(wait_until(SETTLE, || store.subscriber_count() == 1));

        let client = MqClient::new(store.clone());
        client
            .publish(Incr { value: 41 })
            .expect("publish should succeed");
        assert!(wait_until(SETTLE, || server.stats().total_processed == 1));
        server.dispose();
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("first registration should succeed");

        let err = server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect_err("duplicate should fail");
        assert!(matches!(
            err,
            ServerError::Registry(RegistryError::DuplicateHandler { .. })
        ));
    }

    #[test]
    fn registration_after_init_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("registration should succeed");
        server.init();

        let err = server
            .register_handler(|_: &Message<Ping>| -> HandlerResult<Pong> { Ok(None) })
            .expect_err("sealed registry should refuse");
        assert!(matches!(err, ServerError::Registry(RegistryError::Sealed { .. })));
    }

    #[test]
    fn builds_two_workers_per_type_with_priority_queues() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("registration should succeed");
        server
            .register_handler(|_: &Message<Ping>| -> HandlerResult<Pong> { Ok(None) })
            .expect("registration should succeed");

        server.init();
        server.init();

        assert_eq!(server.worker_count(), 4);
        let queues: Vec<String> = server
            .stats()
            .workers
            .into_iter()
            .map(|worker| worker.queue_name)
            .collect();
        assert_eq!(
            queues,
            vec![
                "mq:Incr.inq",
                "mq:Incr.priorityq",
                "mq:Ping.inq",
                "mq:Ping.priorityq"
            ]
        );
    }

    #[test]
    fn priority_workers_follow_disable_flag_and_whitelist() {
        let store = Arc::new(MemoryStore::new());

        let disabled = server_with(
            &store,
            ServerSettings {
                disable_priority_queues: true,
                ..fast_settings()
            },
        );
        disabled
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("registration should succeed");
        disabled
            .register_handler(|_: &Message<Ping>| -> HandlerResult<Pong> { Ok(None) })
            .expect("registration should succeed");
        disabled.init();
        assert_eq!(disabled.worker_count(), 2);

        let whitelisted = server_with(
            &store,
            ServerSettings {
                priority_queue_whitelist: vec!["Ping".to_owned()],
                ..fast_settings()
            },
        );
        whitelisted
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("registration should succeed");
        whitelisted
            .register_handler(|_: &Message<Ping>| -> HandlerResult<Pong> { Ok(None) })
            .expect("registration should succeed");
        whitelisted.init();
        assert_eq!(whitelisted.worker_count(), 3);
    }

    #[test]
    fn stop_and_start_after_dispose_fail_and_dispose_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("registration should succeed");
        server.start().expect("start should succeed");
        assert!(wait_for_state(&server, LifecycleState::Started));

        server.dispose();
        server.dispose();

        assert_eq!(server.status(), "Disposed");
        assert!(matches!(
            server.start(),
            Err(ServerError::Lifecycle(LifecycleError::Disposed { .. }))
        ));
        assert!(matches!(
            server.stop(),
            Err(ServerError::Lifecycle(LifecycleError::Disposed { .. }))
        ));
        assert!(server
            .stats()
            .workers
            .iter()
            .all(|worker| worker.state == LifecycleState::Disposed));
        assert!(wait_until(SETTLE, || store.subscriber_count() == 0));
    }

    #[test]
    fn stop_sentinel_unblocks_controller_and_restart_works() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("registration should succeed");
        server.start().expect("start should succeed");
        assert!(wait_for_state(&server, LifecycleState::Started));
        assert!(wait_until(SETTLE, || store.subscriber_count() == 1));

        server.stop().expect("stop should succeed");
        assert!(wait_for_state(&server, LifecycleState::Stopped));
        assert!(wait_until(SETTLE, || store.subscriber_count() == 0));
        assert!(wait_until(SETTLE, || {
            server
                .stats()
                .workers
                .iter()
                .all(|worker| worker.state == LifecycleState::Stopped)
        }));

        server.start().expect("restart should succeed");
        assert!(wait_for_state(&server, LifecycleState::Started));
        assert_eq!(server.stats().metrics.times_started, 2);
        server.dispose();
    }

    #[test]
    fn external_stop_command_stops_server() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("registration should succeed");
        server.start().expect("start should succeed");
        assert!(wait_until(SETTLE, || store.subscriber_count() == 1));

        store
            .lease()
            .expect("lease should succeed")
            .publish(TOPIC_IN, STOP_COMMAND)
            .expect("publish should succeed");

        assert!(wait_for_state(&server, LifecycleState::Stopped));
        server.dispose();
    }

    #[test]
    fn unknown_queue_notifications_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("registration should succeed");
        server.start().expect("start should succeed");
        assert!(wait_until(SETTLE, || store.subscriber_count() == 1));

        store
            .lease()
            .expect("lease should succeed")
            .publish(TOPIC_IN, "mq:Nobody.inq")
            .expect("publish should succeed");

        assert!(wait_until(SETTLE, || {
            server.stats().metrics.unknown_notifications == 1
        }));
        assert_eq!(server.state(), LifecycleState::Started);
        server.dispose();
    }

    #[test]
    fn controller_connection_loss_collapses_to_stopped_and_reports() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        let reported = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&reported);
        server.set_error_handler(move |error| {
            sink.lock()
                .expect("report mutex poisoned")
                .push(error.to_string());
        });
        server
            .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
            .expect("registration should succeed");
        server.start().expect("start should succeed");
        assert!(wait_until(SETTLE, || store.subscriber_count() == 1));

        store.set_offline(true);

        assert!(wait_for_state(&server, LifecycleState::Stopped));
        let stats = server.stats();
        // Workers losing their pops count as well, so at least the controller's failure.
        assert!(stats.metrics.continuous_errors >= 1);
        assert!(stats.metrics.last_error.is_some());
        assert!(!reported.lock().expect("report mutex poisoned").is_empty());

        store.set_offline(false);
        server.start().expect("restart should succeed");
        assert!(wait_for_state(&server, LifecycleState::Started));
        assert!(wait_until(SETTLE, || server.stats().metrics.continuous_errors == 0));
        server.dispose();
    }

    #[test]
    fn concurrent_lifecycle_calls_end_in_a_valid_state() {
        for _ in 0..5 {
            let store = Arc::new(MemoryStore::new());
            let server = Arc::new(server(&store));
            server
                .register_handler(|_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) })
                .expect("registration should succeed");

            let threads: Vec<_> = (0..9)
                .map(|index| {
                    let server = Arc::clone(&server);
                    thread::spawn(move || match index % 3 {
                        0 => {
                            let _ = server.start();
                        }
                        1 => {
                            let _ = server.stop();
                        }
                        _ => server.dispose(),
                    })
                })
                .collect();
            for thread in threads {
                thread.join().expect("lifecycle thread should not panic");
            }

            assert_eq!(server.state(), LifecycleState::Disposed);
            assert!(wait_until(SETTLE, || store.subscriber_count() == 0));
        }
    }

    #[test]
    fn stats_description_lists_workers_and_counters() {
        let store = Arc::new(MemoryStore::new());
        let server = server(&store);
        server
            .register_handler_with(
                |_: &Message<Incr>| -> HandlerResult<Incr> { Ok(None) },
                HandlerOptions::default().with_retry_count(0),
            )
            .expect("registration should succeed");
        server.init();

        let description = server.stats_description();
        assert!(description.contains("STATUS: Stopped"));
        assert!(description.contains("mq:Incr.inq [Stopped]"));
        assert!(description.contains("WORKERS: 2"));
    }
}
