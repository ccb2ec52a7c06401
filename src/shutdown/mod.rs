use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// SIGINT/SIGTERM flip a shared flag that the supervision loop polls.
pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&triggered))?;
            return Ok(Self {
                triggered,
                sig_ids: vec![id_int, id_term],
            });
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Sleeps up to `timeout`, returning early with `true` once shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::ShutdownHooks;

    #[cfg(unix)]
    #[test]
    fn wait_times_out_until_signalled() {
        let hooks = ShutdownHooks::install().expect("hooks should install");
        assert!(!hooks.is_triggered());

        let started = Instant::now();
        assert!(!hooks.wait(Duration::from_millis(60)));
        assert!(started.elapsed() >= Duration::from_millis(60));

        signal_hook::low_level::raise(signal_hook::consts::signal::SIGTERM)
            .expect("SIGTERM should be raised");
        assert!(hooks.wait(Duration::from_secs(5)));
        assert!(hooks.is_triggered());
    }
}
