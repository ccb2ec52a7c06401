use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters owned by one server instance.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    times_started: AtomicU64,
    total_errors: AtomicU64,
    continuous_errors: AtomicU64,
    workers_replaced: AtomicU64,
    notifications: AtomicU64,
    unknown_notifications: AtomicU64,
    last_error: Mutex<Option<RecordedError>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordedError {
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub times_started: u64,
    pub total_errors: u64,
    pub continuous_errors: u64,
    pub workers_replaced: u64,
    pub notifications: u64,
    pub unknown_notifications: u64,
    pub last_error: Option<RecordedError>,
}

impl ServerMetrics {
    pub fn record_start(&self) {
        self.times_started.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts an error; `continuous` marks errors that should widen the restart backoff.
    pub fn record_error(&self, message: impl Into<String>, continuous: bool) {
        self.total_errors.fetch_add(1, Ordering::SeqCst);
        if continuous {
            self.continuous_errors.fetch_add(1, Ordering::SeqCst);
        }
        *self.lock_last_error() = Some(RecordedError {
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn reset_continuous_errors(&self) {
        self.continuous_errors.store(0, Ordering::SeqCst);
    }

    pub fn continuous_errors(&self) -> u64 {
        self.continuous_errors.load(Ordering::SeqCst)
    }

    pub fn record_replacement(&self) {
        self.workers_replaced.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_notification(&self, matched: bool) {
        if matched {
            self.notifications.fetch_add(1, Ordering::SeqCst);
        } else {
            self.unknown_notifications.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            times_started: self.times_started.load(Ordering::SeqCst),
            total_errors: self.total_errors.load(Ordering::SeqCst),
            continuous_errors: self.continuous_errors(),
            workers_replaced: self.workers_replaced.load(Ordering::SeqCst),
            notifications: self.notifications.load(Ordering::SeqCst),
            unknown_notifications: self.unknown_notifications.load(Ordering::SeqCst),
            last_error: self.lock_last_error().clone(),
        }
    }

    fn lock_last_error(&self) -> MutexGuard<'_, Option<RecordedError>> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
