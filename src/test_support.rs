use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::logging::{LogLevel, LogSink, Logger, LoggerConfig};

#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("memory sink mutex poisoned")
            .clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .expect("memory sink mutex poisoned")
            .push(line.to_owned());
    }
}

pub fn capturing_logger() -> (Arc<Logger>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let logger = Logger::with_sink(
        LoggerConfig {
            min_level: LogLevel::Debug,
            human_friendly: false,
        },
        sink.clone(),
    );
    (Arc::new(logger), sink)
}

/// Polls `condition` every few milliseconds until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
