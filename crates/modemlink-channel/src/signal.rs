//! Wake-up primitive between the producer context and a consumer task.

use std::sync::{Mutex, TryLockError};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// One-waiter notification.
///
/// [`raise`](Signal::raise) never blocks: it only attempts the waiter lock,
/// so it is safe to call from the producer context. The waiter always
/// re-checks its condition after registering, which covers a raise that
/// lands while the lock is held.
#[derive(Debug, Default)]
pub struct Signal {
    waiter: Mutex<Option<Thread>>,
    #[cfg(feature = "async")]
    notify: tokio::sync::Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the waiter, if any. Callers publish their data first.
    pub fn raise(&self) {
        match self.waiter.try_lock() {
            Ok(guard) => {
                if let Some(thread) = guard.as_ref() {
                    thread.unpark();
                }
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                if let Some(thread) = poisoned.into_inner().as_ref() {
                    thread.unpark();
                }
            }
            Err(TryLockError::WouldBlock) => {}
        }
        #[cfg(feature = "async")]
        self.notify.notify_one();
    }

    /// Block the calling thread until `ready` returns true or `timeout`
    /// elapses. Returns the final value of `ready`.
    pub fn wait(&self, timeout: Option<Duration>, mut ready: impl FnMut() -> bool) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.register(Some(thread::current()));
        let result = loop {
            if ready() {
                break true;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break ready();
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        };
        self.register(None);
        result
    }

    /// Async counterpart of [`wait`](Signal::wait).
    #[cfg(feature = "async")]
    pub async fn wait_async(
        &self,
        timeout: Option<Duration>,
        mut ready: impl FnMut() -> bool,
    ) -> bool {
        let wait = async {
            loop {
                if ready() {
                    return;
                }
                self.notify.notified().await;
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    fn register(&self, thread: Option<Thread>) {
        let mut guard = self
            .waiter
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = thread;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn ready_condition_returns_immediately() {
        let signal = Signal::new();
        assert!(signal.wait(Some(Duration::from_secs(5)), || true));
    }

    #[test]
    fn times_out_when_never_ready() {
        let signal = Signal::new();
        let started = Instant::now();
        assert!(!signal.wait(Some(Duration::from_millis(30)), || false));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn raise_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let flag = Arc::new(AtomicBool::new(false));
        let raiser = {
            let signal = Arc::clone(&signal);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::Release);
                signal.raise();
            })
        };
        assert!(signal.wait(Some(Duration::from_secs(5)), || flag.load(Ordering::Acquire)));
        raiser.join().unwrap();
    }

    #[test]
    fn raise_without_waiter_is_harmless() {
        let signal = Signal::new();
        signal.raise();
        signal.raise();
    }
}
