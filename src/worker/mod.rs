//! One worker thread per queue name.
//!
//! A worker drains its queue through the handler, then parks on a condvar until the
//! subscription controller notifies it or the worker is asked to stop. Failures that are
//! not caused by a shutdown stop the worker and are handed to the error callback, which the
//! server uses to replace the worker with a fresh clone.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::handler::{HandlerError, HandlerStats, MessageHandler};
use crate::lifecycle::{LifecycleError, LifecycleState, StateCell};
use crate::logging::{LogLevel, Logger};
use crate::store::{BackingStore, StoreError};

const LOG_CONTEXT: &str = "worker";
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub type WorkerErrorCallback = Arc<dyn Fn(&Arc<Worker>, &WorkerError) + Send + Sync>;

/// Everything a replacement worker inherits from the one it replaces.
#[derive(Clone)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub handler: Arc<dyn MessageHandler>,
    pub on_error: Option<WorkerErrorCallback>,
    pub store: Arc<dyn BackingStore>,
    pub logger: Arc<Logger>,
    pub stop_grace: Duration,
    pub dispose_timeout: Duration,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("queue_name", &self.queue_name)
            .field("message_type", &self.handler.message_type())
            .field("stop_grace", &self.stop_grace)
            .field("dispose_timeout", &self.dispose_timeout)
            .finish()
    }
}

#[derive(Debug)]
pub enum WorkerError {
    Lifecycle(LifecycleError),
    Spawn(io::Error),
    Store(StoreError),
    Handler(HandlerError),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle(source) => write!(f, "{source}"),
            Self::Spawn(source) => write!(f, "failed to spawn worker thread: {source}"),
            Self::Store(source) => write!(f, "worker could not reach the store: {source}"),
            Self::Handler(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl WorkerError {
    /// Failures caused by losing the store rather than by the handler itself.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Store(source) | Self::Handler(HandlerError::Store(source)) => {
                source.is_connection_fault()
            }
            _ => false,
        }
    }
}

impl From<LifecycleError> for WorkerError {
    fn from(value: LifecycleError) -> Self {
        Self::Lifecycle(value)
    }
}

impl From<StoreError> for WorkerError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<HandlerError> for WorkerError {
    fn from(value: HandlerError) -> Self {
        Self::Handler(value)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerStats {
    pub queue_name: String,
    pub state: LifecycleState,
    pub notifications: u64,
    pub processed: u64,
    pub handler: HandlerStats,
}

pub struct Worker {
    config: WorkerConfig,
    state: StateCell,
    notifications: AtomicU64,
    processed: AtomicU64,
    pending: Mutex<bool>,
    wake: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: StateCell::new(LifecycleState::Stopped),
            notifications: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            pending: Mutex::new(false),
            wake: Condvar::new(),
            thread: Mutex::new(None),
        })
    }

    /// Same queue, handler and callback; counters start at zero.
    pub fn clone_fresh(&self) -> Arc<Self> {
        Self::new(self.config.clone())
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn state(&self) -> LifecycleState {
        self.state.load()
    }

    pub fn notification_count(&self) -> u64 {
        self.notifications.load(Ordering::SeqCst)
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        match self.state.load() {
            LifecycleState::Disposed => {
                return Err(LifecycleError::Disposed {
                    component: format!("worker '{}'", self.config.queue_name),
                }
                .into())
            }
            LifecycleState::Started | LifecycleState::Starting => return Ok(()),
            LifecycleState::Stopping => self.join_previous(),
            LifecycleState::Stopped => {}
        }

        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Ok(());
        }

        let worker = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("redmq-worker:{}", self.config.queue_name))
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                *self.lock_thread() = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.state
                    .transition(LifecycleState::Starting, LifecycleState::Stopped);
                Err(WorkerError::Spawn(source))
            }
        }
    }

    /// Records the notification and wakes the loop if it is running. Harmless in any other
    /// state, including after disposal.
    pub fn notify(&self) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
        if matches!(
            self.state.load(),
            LifecycleState::Started | LifecycleState::Starting
        ) {
            *self.lock_pending() = true;
            self.wake.notify_one();
        }
    }

    pub fn stop(&self) {
        let stopping = self
            .state
            .transition(LifecycleState::Started, LifecycleState::Stopping)
            || self
                .state
                .transition(LifecycleState::Starting, LifecycleState::Stopping);
        if !stopping {
            return;
        }

        thread::sleep(self.config.stop_grace);
        let _guard = self.lock_pending();
        self.wake.notify_all();
    }

    pub fn dispose(&self) {
        if self.state.is(LifecycleState::Disposed) {
            return;
        }

        self.stop();
        if self.state.dispose() == LifecycleState::Disposed {
            return;
        }
        {
            let _guard = self.lock_pending();
            self.wake.notify_all();
        }

        let Some(handle) = self.lock_thread().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Disposed from its own error callback; the loop is already unwinding.
            return;
        }

        let deadline = Instant::now() + self.config.dispose_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                self.config.logger.error(
                    Some(LOG_CONTEXT),
                    &format!("worker thread for '{}' panicked", self.config.queue_name),
                );
            }
        } else {
            self.config.logger.log(
                LogLevel::Warn,
                Some(LOG_CONTEXT),
                "Worker thread did not exit in time; detaching",
                Some(json!({
                    "queue": self.config.queue_name,
                    "timeout_ms": self.config.dispose_timeout.as_millis() as u64,
                })),
            );
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            queue_name: self.config.queue_name.clone(),
            state: self.state.load(),
            notifications: self.notification_count(),
            processed: self.processed_count(),
            handler: self.config.handler.stats(),
        }
    }

    fn run(self: Arc<Self>) {
        if !self
            .state
            .transition(LifecycleState::Starting, LifecycleState::Started)
        {
            // Stopped or disposed before the thread got going.
            self.state
                .transition(LifecycleState::Stopping, LifecycleState::Stopped);
            return;
        }
        self.config.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Worker started",
            Some(json!({ "queue": self.config.queue_name })),
        );

        while self.state.is(LifecycleState::Started) {
            if let Err(error) = self.process_batch() {
                self.fail(error);
                return;
            }
            self.park();
        }

        self.state
            .transition(LifecycleState::Stopping, LifecycleState::Stopped);
        self.config.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Worker stopped",
            Some(json!({
                "queue": self.config.queue_name,
                "processed": self.processed_count(),
            })),
        );
    }

    fn process_batch(&self) -> Result<(), WorkerError> {
        let mut connection = self.config.store.lease()?;
        let keep_going = || self.state.is(LifecycleState::Started);
        let taken = self.config.handler.process_queue(
            connection.as_mut(),
            &self.config.queue_name,
            &keep_going,
        )?;
        self.processed.fetch_add(taken, Ordering::SeqCst);
        Ok(())
    }

    fn park(&self) {
        let pending = self.lock_pending();
        let mut pending = self
            .wake
            .wait_while(pending, |pending| {
                !*pending && self.state.is(LifecycleState::Started)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *pending = false;
    }

    fn fail(self: &Arc<Self>, error: WorkerError) {
        if !self
            .state
            .transition(LifecycleState::Started, LifecycleState::Stopped)
        {
            // Shutdown was requested while the batch ran; the failure is an artifact of it.
            self.state
                .transition(LifecycleState::Stopping, LifecycleState::Stopped);
            self.config.logger.log(
                LogLevel::Debug,
                Some(LOG_CONTEXT),
                "Ignoring worker failure during shutdown",
                Some(json!({
                    "queue": self.config.queue_name,
                    "error": error.to_string(),
                })),
            );
            return;
        }

        self.config.logger.log(
            LogLevel::Error,
            Some(LOG_CONTEXT),
            "Worker failed",
            Some(json!({
                "queue": self.config.queue_name,
                "error": error.to_string(),
            })),
        );
        if let Some(callback) = &self.config.on_error {
            callback(self, &error);
        }
    }

    fn join_previous(&self) {
        let Some(handle) = self.lock_thread().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            self.config.logger.error(
                Some(LOG_CONTEXT),
                &format!("worker thread for '{}' panicked", self.config.queue_name),
            );
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, bool> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("queue_name", &self.config.queue_name)
            .field("state", &self.state.load())
            .field("notifications", &self.notification_count())
            .field("processed", &self.processed_count())
            .finish()
    }
}
