use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redmq::config::AppConfig;
use redmq::logging::{LogLevel, Logger, LoggerConfig};
use redmq::shutdown::ShutdownHooks;
use redmq::store;
use redmq::{HandlerResult, LifecycleState, Message, MqServer, ServerSettings};
use serde::{Deserialize, Serialize};
use serde_json::json;

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Built-in health probe: `Ping` on `mq:Ping.inq` answers with `Pong` on `mq:Pong.outq`.
#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    note: Option<String>,
    answered_at: String,
}

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger_config = LoggerConfig::from_logging_config(&app_config.logging).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));

    let backing_store = store::connect(&app_config, &logger).unwrap_or_else(|error| {
        eprintln!("store initialization error: {error}");
        process::exit(2);
    });

    let server = MqServer::new(
        backing_store,
        Arc::clone(&logger),
        ServerSettings::from(&app_config.server),
    );
    let error_logger = Arc::clone(&logger);
    server.set_error_handler(move |error| {
        error_logger.warn(Some("main::server"), &format!("server error: {error}"));
    });
    server
        .register_handler(|message: &Message<Ping>| -> HandlerResult<Pong> {
            Ok(Some(Pong {
                note: message.body.note.clone(),
                answered_at: chrono::Utc::now().to_rfc3339(),
            }))
        })
        .unwrap_or_else(|error| {
            eprintln!("handler registration error: {error}");
            process::exit(2);
        });

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    if let Err(error) = server.start() {
        eprintln!("server start error: {error}");
        process::exit(2);
    }
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} starting queue server",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "store_engine": app_config.store.engine,
            "workers": server.worker_count(),
            "retry_count": app_config.server.retry_count,
            "priority_queues": !app_config.server.disable_priority_queues,
        })),
    );

    supervise(&server, &shutdown_hooks, &logger);

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, disposing server",
    );
    server.dispose();
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Shutdown completed",
        Some(json!(server.stats())),
    );
}

/// Restarts the server after the controller loses its subscription and logs stats
/// periodically. `start()` applies the backoff for repeated failures itself.
fn supervise(server: &MqServer, shutdown_hooks: &ShutdownHooks, logger: &Logger) {
    let mut last_stats = Instant::now();

    while !shutdown_hooks.wait(SUPERVISE_INTERVAL) {
        if server.state() == LifecycleState::Stopped {
            logger.warn(Some("main::server"), "Server stopped unexpectedly; restarting");
            if let Err(error) = server.start() {
                logger.error(Some("main::server"), &format!("restart failed: {error}"));
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            if logger.enabled(LogLevel::Debug) {
                logger.debug(Some("main::stats"), &server.stats_description());
            } else {
                let stats = server.stats();
                logger.log(
                    LogLevel::Info,
                    Some("main::stats"),
                    "Server stats",
                    Some(json!({
                        "status": stats.status,
                        "processed": stats.total_processed,
                        "failed": stats.total_failed,
                        "errors": stats.metrics.total_errors,
                        "workers_replaced": stats.metrics.workers_replaced,
                    })),
                );
            }
        }
    }
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: redmq is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;160m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const APP_DESCRIPTION: &str =
        "Threaded message-queue server over Redis lists and pub/sub.";

    println!("{BANNER_COLOR}redmq{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("REDMQ_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}Press Ctrl+C to stop.{RESET}");
    println!();
}
