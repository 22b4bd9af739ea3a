//! Stream watchdog for held external resources.
//!
//! A resource (e.g. a power-save inhibitor) is acquired when a reply stream
//! starts and must be released exactly once: on completion, on error, on
//! stop, or when the ceiling elapses for a stream that never finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Something held for the duration of a reply stream.
pub trait ResourceGuard: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Guard for front ends with nothing to hold.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGuard;

impl ResourceGuard for NoopGuard {
    fn acquire(&self) {}
    fn release(&self) {}
}

struct Held {
    guard: Arc<dyn ResourceGuard>,
    released: AtomicBool,
}

impl Held {
    fn release_once(&self, reason: &str) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(reason, "Releasing stream resource");
            self.guard.release();
        }
    }
}

/// Handle to an acquired resource. Releases on drop if not released earlier.
pub struct WatchdogHandle {
    held: Arc<Held>,
    timer: JoinHandle<()>,
}

/// Acquires `guard` and arms a timer that force-releases it after `ceiling`.
pub fn hold(guard: Arc<dyn ResourceGuard>, ceiling: Duration) -> WatchdogHandle {
    guard.acquire();
    let held = Arc::new(Held {
        guard,
        released: AtomicBool::new(false),
    });

    let timer_held = Arc::clone(&held);
    let timer = tokio::spawn(async move {
        tokio::time::sleep(ceiling).await;
        tracing::warn!(
            ceiling_secs = ceiling.as_secs(),
            "Stream watchdog elapsed; releasing held resource"
        );
        timer_held.release_once("watchdog");
    });

    WatchdogHandle { held, timer }
}

impl WatchdogHandle {
    pub fn release(self) {
        drop(self);
    }

    pub fn is_released(&self) -> bool {
        self.held.released.load(Ordering::SeqCst)
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.timer.abort();
        self.held.release_once("finished");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::ResourceGuard;

    #[derive(Debug, Default)]
    pub struct CountingGuard {
        pub acquired: AtomicUsize,
        pub released: AtomicUsize,
    }

    impl CountingGuard {
        pub fn acquired(&self) -> usize {
            self.acquired.load(Ordering::SeqCst)
        }

        pub fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl ResourceGuard for CountingGuard {
        fn acquire(&self) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}
