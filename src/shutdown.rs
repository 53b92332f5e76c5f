//! process wide shutdown coordination

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative stop flag shared by every long-running loop and worker.
/// Loops check it on each tick and exit after the current iteration;
/// blocking waits go through [`ShutdownToken::wait`] so a stop request
/// interrupts them promptly.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        ShutdownToken::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for up to `interval`, waking early on shutdown. Returns true
    /// when the process is stopping.
    pub fn wait(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let slice = Duration::from_millis(100);

        while Instant::now() < deadline {
            if self.is_shutdown() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(slice));
        }

        self.is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_early_on_trigger() {
        let token = ShutdownToken::new();
        let clone = token.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            clone.trigger();
        });

        let t0 = Instant::now();
        assert!(token.wait(Duration::from_secs(10)));
        assert!(t0.elapsed() < Duration::from_secs(5));

        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_clean() {
        let token = ShutdownToken::new();
        assert!(!token.wait(Duration::from_millis(50)));
    }
}
