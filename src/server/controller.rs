use std::sync::Arc;

use serde_json::json;

use crate::lifecycle::LifecycleState;
use crate::logging::LogLevel;
use crate::names::{STOP_COMMAND, TOPIC_IN};
use crate::store::{StoreError, SubscriptionEvent, SubscriptionFlow};

use super::{ServerError, ServerInner};

const LOG_CONTEXT: &str = "server::controller";

/// Body of the subscription controller thread. Returns once the server stops, the STOP
/// sentinel arrives or the subscription connection fails.
pub(super) fn run(inner: Arc<ServerInner>) {
    if !inner
        .state
        .transition(LifecycleState::Starting, LifecycleState::Started)
    {
        inner.logger.debug(
            Some(LOG_CONTEXT),
            "Server left Starting before the controller ran; aborting",
        );
        return;
    }
    inner.logger.log(
        LogLevel::Info,
        Some(LOG_CONTEXT),
        "Server started",
        Some(json!({
            "channel": TOPIC_IN,
            "workers": inner.worker_count(),
            "times_started": inner.metrics.snapshot().times_started,
        })),
    );

    let result = inner.store.subscribe(
        &[TOPIC_IN],
        inner.settings.subscription_poll,
        &mut |event| on_event(&inner, event),
    );

    if let Err(error) = result {
        on_subscription_failure(&inner, error);
    }
}

fn on_event(inner: &ServerInner, event: SubscriptionEvent<'_>) -> SubscriptionFlow {
    match event {
        SubscriptionEvent::Subscribed => {
            inner.metrics.reset_continuous_errors();
            inner.logger.debug(Some(LOG_CONTEXT), "Subscribed to notification channel");
            SubscriptionFlow::Continue
        }
        SubscriptionEvent::Message { payload, .. } if payload == STOP_COMMAND => {
            inner.logger.debug(Some(LOG_CONTEXT), "Received STOP");
            halt(inner);
            SubscriptionFlow::Unsubscribe
        }
        SubscriptionEvent::Message { payload, .. } => {
            inner.notify_queue(payload);
            SubscriptionFlow::Continue
        }
        SubscriptionEvent::Idle if inner.state.is(LifecycleState::Started) => {
            SubscriptionFlow::Continue
        }
        SubscriptionEvent::Idle => {
            // stop() could not deliver STOP, or the server was disposed underneath us.
            halt(inner);
            SubscriptionFlow::Unsubscribe
        }
    }
}

fn halt(inner: &ServerInner) {
    inner.stop_workers();
    let stopped = inner
        .state
        .transition(LifecycleState::Started, LifecycleState::Stopped)
        || inner
            .state
            .transition(LifecycleState::Stopping, LifecycleState::Stopped);
    if stopped {
        inner.logger.info(Some(LOG_CONTEXT), "Server stopped");
    }
}

fn on_subscription_failure(inner: &ServerInner, error: StoreError) {
    if !inner.state.is(LifecycleState::Started) {
        // Shutdown already requested; the lost subscription is expected.
        inner.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Subscription ended during shutdown",
            Some(json!({ "error": error.to_string() })),
        );
        halt(inner);
        return;
    }

    let message = error.to_string();
    inner.metrics.record_error(message.clone(), true);
    inner.state.force_unless_disposed(LifecycleState::Stopped);
    inner.stop_workers();
    inner.logger.log(
        LogLevel::Error,
        Some(LOG_CONTEXT),
        "Subscription lost; server stopped",
        Some(json!({
            "error": message,
            "continuous_errors": inner.metrics.continuous_errors(),
        })),
    );
    inner.report(&ServerError::Store(error));
}
