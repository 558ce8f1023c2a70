//! Per-call deadline enforcement.
//!
//! The foreground thread holds a guard for the whole call. One blocking task
//! per call waits to acquire the same guard with a bounded wait: getting it
//! means the call finished, timing out means it is still running and the
//! target gets interrupted.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::v8;
use parking_lot::Mutex;

use crate::error::EngineError;

/// Something a watchdog can forcibly stop.
pub trait Interrupt {
    fn interrupt(&self);
}

impl Interrupt for v8::IsolateHandle {
    fn interrupt(&self) {
        self.terminate_execution();
    }
}

const ARMED: u8 = 0;
const DISARMED: u8 = 1;
const FIRING: u8 = 2;
const FIRED: u8 = 3;

/// Result of a guarded call.
#[derive(Debug)]
pub struct Guarded<R> {
    pub value: R,
    /// The watchdog interrupted the target during this call.
    pub fired: bool,
}

struct Task {
    guard: Mutex<()>,
    state: AtomicU8,
}

/// Background scheduler for watchdog tasks.
///
/// Tasks run on the blocking pool of a private tokio runtime and never on the
/// calling thread.
pub struct Watchdog {
    runtime: Option<tokio::runtime::Runtime>,
}

impl Watchdog {
    pub fn new(threads: usize) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("rasp-watchdog")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Run `call` on the current thread, interrupting `target` if it is still
    /// running after `deadline`.
    pub fn guard<T, R>(&self, target: &T, deadline: Duration, call: impl FnOnce() -> R) -> Guarded<R>
    where
        T: Interrupt + Clone + Send + 'static,
    {
        let Some(runtime) = self.runtime.as_ref() else {
            return Guarded {
                value: call(),
                fired: false,
            };
        };

        let task = Arc::new(Task {
            guard: Mutex::new(()),
            state: AtomicU8::new(ARMED),
        });

        let held = task.guard.lock();
        // Measured from here, not from when a pool thread picks the task up.
        let expires = Instant::now() + deadline;

        let watcher = Arc::clone(&task);
        let target = target.clone();
        runtime.spawn_blocking(move || {
            if watcher.guard.try_lock_until(expires).is_some() {
                return;
            }
            if watcher
                .state
                .compare_exchange(ARMED, FIRING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                target.interrupt();
                watcher.state.store(FIRED, Ordering::Release);
            }
        });

        let value = call();

        let fired = match task
            .state
            .compare_exchange(ARMED, DISARMED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(_) => {
                // Lost the race: wait until the interrupt has been delivered.
                while task.state.load(Ordering::Acquire) != FIRED {
                    std::hint::spin_loop();
                }
                true
            }
        };
        drop(held);

        Guarded { value, fired }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Clone, Default)]
    struct Flag {
        hits: Arc<AtomicUsize>,
        stop: Arc<AtomicBool>,
    }

    impl Interrupt for Flag {
        fn interrupt(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.stop.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fast_call_is_not_interrupted() {
        let watchdog = Watchdog::new(2).unwrap();
        let flag = Flag::default();

        let result = watchdog.guard(&flag, Duration::from_millis(200), || 42);

        assert_eq!(result.value, 42);
        assert!(!result.fired);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(flag.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_runaway_call_is_interrupted() {
        let watchdog = Watchdog::new(2).unwrap();
        let flag = Flag::default();
        let stop = Arc::clone(&flag.stop);

        let start = Instant::now();
        let result = watchdog.guard(&flag, Duration::from_millis(50), || {
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            "stopped"
        });

        assert_eq!(result.value, "stopped");
        assert!(result.fired);
        assert_eq!(flag.hits.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_call_finishing_after_deadline_reports_fired() {
        let watchdog = Watchdog::new(1).unwrap();
        let flag = Flag::default();

        // Ignores the interrupt and returns on its own.
        let result = watchdog.guard(&flag, Duration::from_millis(10), || {
            std::thread::sleep(Duration::from_millis(100));
        });

        assert!(result.fired);
        assert_eq!(flag.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_back_to_back_calls() {
        let watchdog = Watchdog::new(2).unwrap();
        let flag = Flag::default();

        for i in 0..50 {
            let result = watchdog.guard(&flag, Duration::from_millis(500), || i);
            assert_eq!(result.value, i);
            assert!(!result.fired);
        }
        assert_eq!(flag.hits.load(Ordering::SeqCst), 0);
    }
}
